use serde::Serialize;
use tracing::info;

use crate::{
    error::ServiceResult,
    nbyte::ByteSize,
    service::PackageService,
    types::{PackageUpdateInfo, UpdateStatus},
};

/// 下载计划，构造后不可修改，新计划整体替换旧计划
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadPlan {
    total_download_size: u64,
    infos: Vec<PackageUpdateInfo>,
}

impl DownloadPlan {
    pub fn new(total_download_size: u64, infos: Vec<PackageUpdateInfo>) -> Self {
        Self {
            total_download_size,
            infos,
        }
    }

    /// 仍需下载的字节数
    pub fn total_download_size(&self) -> u64 {
        self.total_download_size
    }

    pub fn infos(&self) -> &[PackageUpdateInfo] {
        &self.infos
    }

    /// 由计划推导出的状态
    pub fn status(&self) -> UpdateStatus {
        if self.infos.is_empty() {
            UpdateStatus::Updated
        } else if self.total_download_size == 0 {
            UpdateStatus::Downloaded
        } else {
            UpdateStatus::UpdatesAvailable
        }
    }
}

/// 查询可更新包的下载大小并生成计划
pub async fn plan_downloads(
    service: &dyn PackageService,
    updatable_packages: &[String],
    infos: Vec<PackageUpdateInfo>,
) -> ServiceResult<DownloadPlan> {
    let size = service.packages_download_size(updatable_packages).await?;
    info!(
        packages = updatable_packages.len(),
        entries = infos.len(),
        size = %ByteSize(size),
        "Download plan ready"
    );
    Ok(DownloadPlan::new(size, infos))
}
