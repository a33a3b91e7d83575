use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use crate::plan::DownloadPlan;

/// 测速失败或不可达时的分数（越小越快）
pub const UNREACHABLE_SCORE: u32 = 10000;

/// 镜像 ID -> 测速分数
pub type MirrorSpeedMap = BTreeMap<String, u32>;

/// 更新流程阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// 检查更新（刷新软件源）
    CheckSource,
    /// 下载更新包
    Download,
    /// 安装更新
    DistUpgrade,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::CheckSource, Phase::Download, Phase::DistUpgrade];

    /// 根据任务的 type 字段推断所属阶段，未知类型一律视为安装
    pub fn from_job_type(job_type: &str) -> Self {
        match job_type {
            "update_source" => Phase::CheckSource,
            "download" => Phase::Download,
            _ => Phase::DistUpgrade,
        }
    }

    /// 任务失败后是否保留（不清理），以便用户手动重试
    pub fn retains_failed_job(self) -> bool {
        matches!(self, Phase::Download)
    }
}

/// 外部任务状态
///
/// 服务端对“成功”有 `success` 与 `succeed` 两种拼写，这里统一归一化为
/// [`JobStatus::Succeeded`]。匹配区分大小写。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// 等待开始
    Pending,
    /// 正在执行
    Running,
    /// 已暂停
    Paused,
    /// 成功
    Succeeded,
    /// 失败
    Failed,
    /// 服务端已结束并清理该任务
    Ended,
}

impl JobStatus {
    /// 解析服务端上报的状态字符串
    pub fn from_wire(status: &str) -> Self {
        match status {
            "failed" => JobStatus::Failed,
            "success" | "succeed" => JobStatus::Succeeded,
            "paused" => JobStatus::Paused,
            "end" => JobStatus::Ended,
            "ready" | "pending" => JobStatus::Pending,
            _ => JobStatus::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Ended
        )
    }
}

/// 外部服务返回的任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// 任务 ID
    pub id: String,
    /// 任务类型（`update_source`、`download`、`dist_upgrade` 等）
    pub job_type: String,
    /// 原始状态字符串
    pub status: String,
    /// 进度 0.0 - 1.0
    pub progress: f64,
}

/// 服务端返回的原始应用更新记录
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppUpdateRecord {
    pub package_id: String,
    pub name: String,
    pub current_version: String,
    pub available_version: String,
}

/// 单个包的更新信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageUpdateInfo {
    pub package_id: String,
    pub name: String,
    pub current_version: String,
    pub available_version: String,
    /// 图标路径，元数据缺失时为空
    pub icon: Option<PathBuf>,
    /// 更新日志，找不到时为空字符串
    pub changelog: String,
}

/// 镜像源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorInfo {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// 对外发布的更新状态，任一时刻只有一个值成立
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// 系统已是最新
    #[default]
    Updated,
    /// 正在检查更新
    Checking,
    /// 有可用更新
    UpdatesAvailable,
    /// 正在下载
    Downloading,
    /// 下载已暂停
    DownloadPaused,
    /// 已下载，等待安装
    Downloaded,
    /// 正在安装
    Installing,
    /// 安装成功
    UpdateSucceeded,
    /// 更新失败
    UpdateFailed,
    /// 需要重启
    NeedRestart,
}

/// 外部服务推送的通知
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceEvent {
    /// 服务端任务列表变化（完整列表）
    JobListChanged(Vec<JobInfo>),
    /// 任务状态变化
    JobStatusChanged { job_id: String, status: String },
    /// 任务进度变化
    JobProgressChanged { job_id: String, progress: f64 },
    /// 任务类型变化
    JobTypeChanged { job_id: String, job_type: String },
    /// 自动清理缓存开关变化
    AutoCleanChanged(bool),
    /// 自动下载更新开关变化
    AutoDownloadUpdatesChanged(bool),
    /// 默认镜像源变化
    MirrorSourceChanged(String),
    /// 是否使用电池供电
    OnBatteryChanged(bool),
    /// 电池电量百分比
    BatteryPercentageChanged(f64),
}

/// 编排器对外发布的事件
#[derive(Debug, Clone)]
pub enum UpdateEvent {
    /// 状态变化
    StatusChanged(UpdateStatus),
    /// 整体进度（0.0 - 1.0）
    ProgressChanged(f64),
    /// 下载进度（0.0 - 1.0）
    DownloadProgressChanged(f64),
    /// 下载计划被替换
    DownloadPlanChanged(Arc<DownloadPlan>),
    /// 镜像列表更新
    MirrorsChanged(Vec<MirrorInfo>),
    /// 默认镜像变化
    DefaultMirrorChanged(String),
    /// 测速结果更新（完整映射）
    MirrorSpeedChanged(MirrorSpeedMap),
    /// 低电量标记变化
    LowBatteryChanged(bool),
    /// 自动清理缓存开关
    AutoCleanChanged(bool),
    /// 自动下载更新开关
    AutoDownloadUpdatesChanged(bool),
}

/// 编排器维护的可观察状态快照
#[derive(Debug, Clone, Default)]
pub struct UpdateModel {
    pub status: UpdateStatus,
    /// 整体进度
    pub progress: f64,
    /// 当前下载任务的进度
    pub download_progress: f64,
    pub plan: Option<Arc<DownloadPlan>>,
    pub mirrors: Vec<MirrorInfo>,
    pub default_mirror: String,
    pub mirror_speeds: MirrorSpeedMap,
    pub low_battery: bool,
    pub auto_clean: bool,
    pub auto_download: bool,
}
