//! 测试用的内存服务

use async_trait::async_trait;
use std::{
    collections::HashSet,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    error::{ServiceError, ServiceResult},
    service::{PackageService, PowerService},
    types::{AppUpdateRecord, JobInfo, MirrorInfo},
};

/// 记录调用并按预设返回结果的包管理服务
#[derive(Default)]
pub(crate) struct FakeService {
    calls: Mutex<Vec<String>>,
    next_job: AtomicUsize,
    failing: Mutex<HashSet<&'static str>>,
    pub records: Mutex<Vec<AppUpdateRecord>>,
    pub packages: Mutex<Vec<String>>,
    pub download_size: Mutex<u64>,
    pub mirrors: Mutex<Vec<MirrorInfo>>,
    pub jobs: Mutex<Vec<JobInfo>>,
    /// `job_list` 应答前的延迟
    pub job_list_delay: Mutex<Duration>,
}

impl FakeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让指定方法返回错误
    pub fn fail(&self, method: &'static str) {
        self.failing.lock().unwrap().insert(method);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(':').next() == Some(method))
            .count()
    }

    pub fn called_with(&self, call: &str) -> bool {
        self.calls.lock().unwrap().iter().any(|c| c == call)
    }

    fn record(&self, method: &'static str, arg: Option<&str>) -> ServiceResult<()> {
        let entry = match arg {
            Some(arg) => format!("{method}:{arg}"),
            None => method.to_string(),
        };
        self.calls.lock().unwrap().push(entry);
        if self.failing.lock().unwrap().contains(method) {
            return Err(ServiceError::request_failed(method, "injected failure"));
        }
        Ok(())
    }

    fn new_job(&self, job_type: &str) -> JobInfo {
        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        JobInfo {
            id: format!("{job_type}-{n}"),
            job_type: job_type.to_string(),
            status: "ready".to_string(),
            progress: 0.0,
        }
    }
}

#[async_trait]
impl PackageService for FakeService {
    async fn update_source(&self) -> ServiceResult<JobInfo> {
        self.record("update_source", None)?;
        Ok(self.new_job("update_source"))
    }

    async fn prepare_dist_upgrade(&self) -> ServiceResult<JobInfo> {
        self.record("prepare_dist_upgrade", None)?;
        Ok(self.new_job("download"))
    }

    async fn dist_upgrade(&self) -> ServiceResult<JobInfo> {
        self.record("dist_upgrade", None)?;
        Ok(self.new_job("dist_upgrade"))
    }

    async fn packages_download_size(&self, _packages: &[String]) -> ServiceResult<u64> {
        self.record("packages_download_size", None)?;
        Ok(*self.download_size.lock().unwrap())
    }

    async fn updatable_apps(&self) -> ServiceResult<Vec<String>> {
        self.record("updatable_apps", None)?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.package_id.clone())
            .collect())
    }

    async fn updatable_packages(&self) -> ServiceResult<Vec<String>> {
        self.record("updatable_packages", None)?;
        Ok(self.packages.lock().unwrap().clone())
    }

    async fn application_update_infos(
        &self,
        locale: &str,
    ) -> ServiceResult<Vec<AppUpdateRecord>> {
        self.record("application_update_infos", Some(locale))?;
        Ok(self.records.lock().unwrap().clone())
    }

    async fn set_auto_download_updates(&self, enable: bool) -> ServiceResult<()> {
        self.record("set_auto_download_updates", Some(&enable.to_string()))
    }

    async fn auto_download_updates(&self) -> ServiceResult<bool> {
        self.record("auto_download_updates", None)?;
        Ok(true)
    }

    async fn set_mirror_source(&self, id: &str) -> ServiceResult<()> {
        self.record("set_mirror_source", Some(id))
    }

    async fn list_mirror_sources(&self, locale: &str) -> ServiceResult<Vec<MirrorInfo>> {
        self.record("list_mirror_sources", Some(locale))?;
        Ok(self.mirrors.lock().unwrap().clone())
    }

    async fn mirror_source(&self) -> ServiceResult<String> {
        self.record("mirror_source", None)?;
        Ok("default".to_string())
    }

    async fn set_auto_clean(&self, enable: bool) -> ServiceResult<()> {
        self.record("set_auto_clean", Some(&enable.to_string()))
    }

    async fn auto_clean(&self) -> ServiceResult<bool> {
        self.record("auto_clean", None)?;
        Ok(true)
    }

    async fn clean_job(&self, job_id: &str) -> ServiceResult<()> {
        self.record("clean_job", Some(job_id))
    }

    async fn pause_job(&self, job_id: &str) -> ServiceResult<()> {
        self.record("pause_job", Some(job_id))
    }

    async fn start_job(&self, job_id: &str) -> ServiceResult<()> {
        self.record("start_job", Some(job_id))
    }

    async fn job_list(&self) -> ServiceResult<Vec<JobInfo>> {
        self.record("job_list", None)?;
        let jobs = self.jobs.lock().unwrap().clone();
        let delay = *self.job_list_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(jobs)
    }
}

/// 固定读数的电源服务
pub(crate) struct FakePower {
    pub on_battery: bool,
    pub percentage: f64,
}

#[async_trait]
impl PowerService for FakePower {
    async fn on_battery(&self) -> ServiceResult<bool> {
        Ok(self.on_battery)
    }

    async fn battery_percentage(&self) -> ServiceResult<f64> {
        Ok(self.percentage)
    }
}
