use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 镜像测速方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeBackend {
    /// 调用外部测速工具
    Command,
    /// 直接发 HTTP HEAD 请求计时
    Http,
}

/// 镜像测速配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub backend: ProbeBackend,
    /// 测速工具
    pub program: String,
    /// 追加在 URL 之后的参数
    pub args: Vec<String>,
    /// HTTP 测速超时（秒）
    pub http_timeout: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            backend: ProbeBackend::Command,
            program: "netselect".to_string(),
            args: vec!["-s".to_string(), "1".to_string()],
            http_timeout: 5,
        }
    }
}

/// 更新编排配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// 首选语言，例如 `zh_CN`
    pub locale: String,
    /// 首选语言没有更新日志时使用的语言
    pub fallback_locale: String,
    /// 包元数据根目录
    pub metadata_dir: PathBuf,
    /// 系统级版本记录
    pub install_log: PathBuf,
    /// 安装成功后等待重启的标记文件
    pub restart_marker: PathBuf,
    /// 代表系统补丁的包名
    pub platform_package: String,
    /// 系统补丁条目的显示名称
    pub platform_name: String,
    /// 事件通道容量
    pub event_buffer: usize,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            locale: system_locale(),
            fallback_locale: "en_US".to_string(),
            metadata_dir: PathBuf::from("/lastore/metadata"),
            install_log: PathBuf::from("/var/lib/lastore/update_infos.json"),
            restart_marker: PathBuf::from("/tmp/.dcc-update-successd"),
            platform_package: "dde".to_string(),
            platform_name: "Deepin".to_string(),
            event_buffer: 1024,
            probe: ProbeConfig::default(),
        }
    }
}

impl UpdateConfig {
    /// 从文件加载配置
    pub async fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs_err::tokio::read_to_string(path).await?;
            let config: UpdateConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            // 配置文件不存在时使用默认配置
            Ok(Self::default())
        }
    }

    /// 保存配置到文件
    pub async fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs_err::tokio::write(path, content).await?;
        Ok(())
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.locale.is_empty() {
            anyhow::bail!("locale must not be empty");
        }
        if self.event_buffer == 0 {
            anyhow::bail!("event_buffer must be greater than 0");
        }
        if self.probe.backend == ProbeBackend::Command && self.probe.program.is_empty() {
            anyhow::bail!("probe.program must not be empty");
        }
        if self.probe.http_timeout == 0 {
            anyhow::bail!("probe.http_timeout must be greater than 0");
        }
        Ok(())
    }
}

/// 从环境变量推断系统语言，去掉编码后缀
pub fn system_locale() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find_map(|value| normalize_locale(&value))
        .unwrap_or_else(|| "en_US".to_string())
}

fn normalize_locale(value: &str) -> Option<String> {
    let name = value.split(['.', '@']).next()?.trim();
    match name {
        "" | "C" | "POSIX" => None,
        name => Some(name.to_string()),
    }
}
