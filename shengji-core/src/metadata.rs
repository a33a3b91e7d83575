//! 包更新信息汇总
//!
//! 把服务端给出的原始应用记录和本地元数据（更新日志、图标）合并成有序的更新列表。
//! 单个包的元数据缺失或损坏只会让该条目的日志和图标为空，不影响整体结果。

use fs_err::tokio as fs;
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

use crate::{
    config::UpdateConfig,
    error::MetadataError,
    marker::RestartMarker,
    types::{AppUpdateRecord, PackageUpdateInfo},
};

/// 系统补丁条目在没有日志时使用的版本号
pub const PATCHES_VERSION: &str = "Patches";
/// 系统补丁条目在没有日志时使用的说明
pub const PATCHES_CHANGELOG: &str = "System patches.";

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    changelog: HashMap<String, String>,
    #[serde(default)]
    locales: HashMap<String, LocaleSection>,
}

#[derive(Debug, Default, Deserialize)]
struct LocaleSection {
    #[serde(default)]
    changelog: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstallLogEntry {
    package: String,
    #[serde(default)]
    current_version: String,
    #[serde(default)]
    last_version: String,
}

/// 汇总结果
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// 没有任何更新且上次安装后尚未重启
    NeedRestart,
    /// 更新列表，可能为空
    Updates(Vec<PackageUpdateInfo>),
}

/// 本地包元数据
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
    install_log: PathBuf,
    locale: String,
    fallback_locale: String,
    platform_package: String,
    platform_name: String,
}

impl MetadataStore {
    pub fn new(config: &UpdateConfig) -> Self {
        Self {
            root: config.metadata_dir.clone(),
            install_log: config.install_log.clone(),
            locale: config.locale.clone(),
            fallback_locale: config.fallback_locale.clone(),
            platform_package: config.platform_package.clone(),
            platform_name: config.platform_name.clone(),
        }
    }

    fn meta_dir(&self, package_id: &str) -> PathBuf {
        self.root.join(package_id).join("meta")
    }

    /// 解析单个包的版本、图标和更新日志
    pub async fn resolve(&self, record: &AppUpdateRecord) -> PackageUpdateInfo {
        let meta_dir = self.meta_dir(&record.package_id);
        let icon = meta_dir
            .join("icons")
            .join(format!("{}.svg", record.package_id));

        let changelog = match read_json::<Manifest>(&meta_dir.join("manifest.json")).await {
            Ok(manifest) => self.changelog_for(&manifest, &record.available_version),
            Err(e) => {
                debug!(package = %record.package_id, error = %e, "No usable manifest");
                String::new()
            }
        };

        PackageUpdateInfo {
            package_id: record.package_id.clone(),
            name: record.name.clone(),
            current_version: record.current_version.clone(),
            available_version: record.available_version.clone(),
            icon: fs::metadata(&icon).await.is_ok().then_some(icon),
            changelog,
        }
    }

    /// 本地化日志优先，其次是顶层日志
    fn changelog_for(&self, manifest: &Manifest, version: &str) -> String {
        let localized = manifest
            .locales
            .get(&self.locale)
            .filter(|section| !section.changelog.is_empty())
            .or_else(|| manifest.locales.get(&self.fallback_locale))
            .and_then(|section| section.changelog.get(version))
            .filter(|text| !text.is_empty());

        localized
            .or_else(|| manifest.changelog.get(version))
            .cloned()
            .unwrap_or_default()
    }

    /// 从安装记录中读取系统级版本
    async fn platform_record(&self) -> AppUpdateRecord {
        let mut record = AppUpdateRecord {
            package_id: self.platform_package.clone(),
            name: self.platform_name.clone(),
            ..Default::default()
        };

        match read_json::<Vec<InstallLogEntry>>(&self.install_log).await {
            Ok(entries) => {
                if let Some(entry) = entries
                    .into_iter()
                    .find(|entry| entry.package == self.platform_package)
                {
                    record.current_version = entry.current_version;
                    record.available_version = entry.last_version;
                }
            }
            Err(e) => debug!(error = %e, "Install log unavailable"),
        }

        record
    }

    /// 生成系统补丁条目
    pub async fn platform_entry(&self) -> PackageUpdateInfo {
        let record = self.platform_record().await;
        let mut info = self.resolve(&record).await;
        if info.changelog.is_empty() {
            info.available_version = PATCHES_VERSION.to_string();
            info.changelog = PATCHES_CHANGELOG.to_string();
        }
        info
    }

    /// 合并原始记录和可更新包列表
    ///
    /// 可更新包数多于应用数时，说明存在不属于任何应用的系统补丁，
    /// 此时在列表最前面补一个系统条目。
    pub async fn aggregate(
        &self,
        records: &[AppUpdateRecord],
        updatable_packages: &[String],
        marker: &RestartMarker,
    ) -> Aggregation {
        if records.is_empty() && updatable_packages.is_empty() && marker.exists() {
            return Aggregation::NeedRestart;
        }

        let mut infos = Vec::with_capacity(records.len() + 1);
        for record in records {
            infos.push(self.resolve(record).await);
        }

        debug!(
            packages = updatable_packages.len(),
            apps = records.len(),
            "Aggregating update infos"
        );
        if updatable_packages.len() > records.len() {
            infos.insert(0, self.platform_entry().await);
        }

        Aggregation::Updates(infos)
    }
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, MetadataError> {
    let content = fs::read(path)
        .await
        .map_err(|source| MetadataError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&content).map_err(|source| {
        warn!(path = %path.display(), "Malformed metadata");
        MetadataError::Malformed {
            path: path.to_path_buf(),
            source,
        }
    })
}
