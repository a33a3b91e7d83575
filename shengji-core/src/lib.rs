//! 系统更新编排
//!
//! 驱动“检查更新 → 下载 → 安装”三个阶段的外部任务，汇总各包的更新信息，
//! 对镜像源测速，并根据电源状态给出低电量提示。

pub mod config;
pub mod error;
pub mod job;
pub mod marker;
pub mod metadata;
pub mod mirror;
pub mod nbyte;
pub mod orchestrator;
pub mod plan;
pub mod power;
pub mod service;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ProbeBackend, ProbeConfig, UpdateConfig};
pub use error::{MetadataError, ProbeError, ServiceError, ServiceResult};
pub use mirror::{CommandProbe, HttpProbe, MirrorProber, MirrorSpeed, SpeedProbe, probe_from_config};
pub use orchestrator::{UpdateHandle, UpdateOrchestrator};
pub use plan::DownloadPlan;
pub use service::{PackageService, PowerService};
pub use types::*;
