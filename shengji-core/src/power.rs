/// 低于该电量且使用电池时视为低电量
pub const LOW_BATTERY_THRESHOLD: f64 = 50.0;

/// 电源状态观察者
///
/// 只负责推导低电量标记，不会启动、暂停或停止任何任务。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerGate {
    on_battery: bool,
    battery_percentage: f64,
}

impl Default for PowerGate {
    // 电源服务尚未上报之前按电池供电、电量 0 处理
    fn default() -> Self {
        Self {
            on_battery: true,
            battery_percentage: 0.0,
        }
    }
}

impl PowerGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 更新供电方式，返回新的低电量标记
    pub fn set_on_battery(&mut self, on_battery: bool) -> bool {
        self.on_battery = on_battery;
        self.low_battery()
    }

    /// 更新电量，返回新的低电量标记
    pub fn set_battery_percentage(&mut self, percentage: f64) -> bool {
        self.battery_percentage = percentage.clamp(0.0, 100.0);
        self.low_battery()
    }

    pub fn on_battery(&self) -> bool {
        self.on_battery
    }

    pub fn battery_percentage(&self) -> f64 {
        self.battery_percentage
    }

    pub fn low_battery(&self) -> bool {
        self.on_battery && self.battery_percentage < LOW_BATTERY_THRESHOLD
    }
}
