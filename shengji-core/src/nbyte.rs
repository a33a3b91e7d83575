use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    B,
    KB,
    MB,
    GB,
    TB,
}

impl Unit {
    const ALL: [Unit; 5] = [Unit::B, Unit::KB, Unit::MB, Unit::GB, Unit::TB];

    fn shift(self) -> u32 {
        match self {
            Unit::B => 0,
            Unit::KB => 10,
            Unit::MB => 20,
            Unit::GB => 30,
            Unit::TB => 40,
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Unit::B => "B",
            Unit::KB => "KB",
            Unit::MB => "MB",
            Unit::GB => "GB",
            Unit::TB => "TB",
        })
    }
}

/// 用于日志和界面展示的下载大小
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// 不小于 1 的最大单位
    pub fn unit(self) -> Unit {
        Unit::ALL
            .into_iter()
            .rev()
            .find(|unit| self.0 >> unit.shift() > 0)
            .unwrap_or(Unit::B)
    }

    pub fn to_float(self) -> f64 {
        self.0 as f64 / (1u64 << self.unit().shift()) as f64
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit() {
            Unit::B => write!(f, "{} B", self.0),
            unit => write!(f, "{:.2} {}", self.to_float(), unit),
        }
    }
}
