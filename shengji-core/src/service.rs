//! 外部服务接口
//!
//! 包管理服务和电源服务都由调用方实现（例如 D-Bus 代理），编排器只依赖这里的 trait。
//! 服务的推送通知通过 [`UpdateHandle::notify`](crate::UpdateHandle::notify) 送入编排器。

use async_trait::async_trait;

use crate::{
    error::ServiceResult,
    types::{AppUpdateRecord, JobInfo, MirrorInfo},
};

/// 包管理服务
#[async_trait]
pub trait PackageService: Send + Sync {
    /// 刷新软件源，返回新建的检查任务
    async fn update_source(&self) -> ServiceResult<JobInfo>;

    /// 下载全部可更新的包，返回下载任务
    async fn prepare_dist_upgrade(&self) -> ServiceResult<JobInfo>;

    /// 安装更新，返回安装任务
    async fn dist_upgrade(&self) -> ServiceResult<JobInfo>;

    /// 给定包还需要下载的总字节数
    async fn packages_download_size(&self, packages: &[String]) -> ServiceResult<u64>;

    async fn updatable_apps(&self) -> ServiceResult<Vec<String>>;

    async fn updatable_packages(&self) -> ServiceResult<Vec<String>>;

    async fn application_update_infos(&self, locale: &str)
    -> ServiceResult<Vec<AppUpdateRecord>>;

    async fn set_auto_download_updates(&self, enable: bool) -> ServiceResult<()>;

    async fn auto_download_updates(&self) -> ServiceResult<bool>;

    async fn set_mirror_source(&self, id: &str) -> ServiceResult<()>;

    async fn list_mirror_sources(&self, locale: &str) -> ServiceResult<Vec<MirrorInfo>>;

    /// 当前默认镜像 ID
    async fn mirror_source(&self) -> ServiceResult<String>;

    async fn set_auto_clean(&self, enable: bool) -> ServiceResult<()>;

    async fn auto_clean(&self) -> ServiceResult<bool>;

    async fn clean_job(&self, job_id: &str) -> ServiceResult<()>;

    async fn pause_job(&self, job_id: &str) -> ServiceResult<()>;

    async fn start_job(&self, job_id: &str) -> ServiceResult<()>;

    /// 服务端当前存在的全部任务
    async fn job_list(&self) -> ServiceResult<Vec<JobInfo>>;
}

/// 电源服务
#[async_trait]
pub trait PowerService: Send + Sync {
    async fn on_battery(&self) -> ServiceResult<bool>;

    /// 电池显示电量（0 - 100）
    async fn battery_percentage(&self) -> ServiceResult<f64>;
}
