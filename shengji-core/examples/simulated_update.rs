use anyhow::Result;
use async_trait::async_trait;
use shengji_core::{
    AppUpdateRecord, JobInfo, MirrorInfo, PackageService, PowerService, ServiceEvent,
    ServiceResult, UpdateConfig, UpdateEvent, UpdateHandle, UpdateOrchestrator, UpdateStatus,
    nbyte::ByteSize, probe_from_config,
};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// 内存中的包管理服务，新建的任务交给 `play_jobs` 模拟执行
struct SimulatedService {
    next_job: AtomicUsize,
    jobs_tx: mpsc::Sender<JobInfo>,
}

impl SimulatedService {
    async fn create(&self, job_type: &str) -> ServiceResult<JobInfo> {
        let n = self.next_job.fetch_add(1, Ordering::SeqCst) + 1;
        let job = JobInfo {
            id: format!("{job_type}_job_{n}"),
            job_type: job_type.to_string(),
            status: "ready".to_string(),
            progress: 0.0,
        };
        let _ = self.jobs_tx.send(job.clone()).await;
        Ok(job)
    }
}

#[async_trait]
impl PackageService for SimulatedService {
    async fn update_source(&self) -> ServiceResult<JobInfo> {
        self.create("update_source").await
    }

    async fn prepare_dist_upgrade(&self) -> ServiceResult<JobInfo> {
        self.create("download").await
    }

    async fn dist_upgrade(&self) -> ServiceResult<JobInfo> {
        self.create("dist_upgrade").await
    }

    async fn packages_download_size(&self, _packages: &[String]) -> ServiceResult<u64> {
        Ok(187 * 1024 * 1024)
    }

    async fn updatable_apps(&self) -> ServiceResult<Vec<String>> {
        Ok(vec!["deepin-editor".to_string(), "deepin-terminal".to_string()])
    }

    async fn updatable_packages(&self) -> ServiceResult<Vec<String>> {
        Ok(["deepin-editor", "deepin-terminal", "libc6", "linux-image"]
            .iter()
            .map(|p| p.to_string())
            .collect())
    }

    async fn application_update_infos(
        &self,
        _locale: &str,
    ) -> ServiceResult<Vec<AppUpdateRecord>> {
        Ok(vec![
            AppUpdateRecord {
                package_id: "deepin-editor".to_string(),
                name: "Text Editor".to_string(),
                current_version: "5.9.1".to_string(),
                available_version: "5.10.0".to_string(),
            },
            AppUpdateRecord {
                package_id: "deepin-terminal".to_string(),
                name: "Terminal".to_string(),
                current_version: "5.4.2".to_string(),
                available_version: "5.4.8".to_string(),
            },
        ])
    }

    async fn set_auto_download_updates(&self, _enable: bool) -> ServiceResult<()> {
        Ok(())
    }

    async fn auto_download_updates(&self) -> ServiceResult<bool> {
        Ok(false)
    }

    async fn set_mirror_source(&self, _id: &str) -> ServiceResult<()> {
        Ok(())
    }

    async fn list_mirror_sources(&self, _locale: &str) -> ServiceResult<Vec<MirrorInfo>> {
        Ok(vec![
            MirrorInfo {
                id: "default".to_string(),
                name: "Official".to_string(),
                url: "https://community-packages.deepin.com/deepin/".to_string(),
            },
            MirrorInfo {
                id: "tuna".to_string(),
                name: "TUNA".to_string(),
                url: "https://mirrors.tuna.tsinghua.edu.cn/deepin/".to_string(),
            },
        ])
    }

    async fn mirror_source(&self) -> ServiceResult<String> {
        Ok("default".to_string())
    }

    async fn set_auto_clean(&self, _enable: bool) -> ServiceResult<()> {
        Ok(())
    }

    async fn auto_clean(&self) -> ServiceResult<bool> {
        Ok(true)
    }

    async fn clean_job(&self, _job_id: &str) -> ServiceResult<()> {
        Ok(())
    }

    async fn pause_job(&self, _job_id: &str) -> ServiceResult<()> {
        Ok(())
    }

    async fn start_job(&self, _job_id: &str) -> ServiceResult<()> {
        Ok(())
    }

    async fn job_list(&self) -> ServiceResult<Vec<JobInfo>> {
        Ok(Vec::new())
    }
}

struct MainsPower;

#[async_trait]
impl PowerService for MainsPower {
    async fn on_battery(&self) -> ServiceResult<bool> {
        Ok(false)
    }

    async fn battery_percentage(&self) -> ServiceResult<f64> {
        Ok(100.0)
    }
}

/// 按 10% 的步长推进任务，然后上报成功
async fn play_jobs(mut jobs: mpsc::Receiver<JobInfo>, handle: UpdateHandle) {
    while let Some(job) = jobs.recv().await {
        let handle = handle.clone();
        tokio::spawn(async move {
            for step in 1..=10 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                handle
                    .notify(ServiceEvent::JobProgressChanged {
                        job_id: job.id.clone(),
                        progress: f64::from(step) / 10.0,
                    })
                    .await;
            }
            handle
                .notify(ServiceEvent::JobStatusChanged {
                    job_id: job.id.clone(),
                    status: "succeed".to_string(),
                })
                .await;
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let dir = tempfile::tempdir()?;
    let config = UpdateConfig {
        metadata_dir: dir.path().join("metadata"),
        install_log: dir.path().join("update_infos.json"),
        restart_marker: dir.path().join("restart-pending"),
        ..Default::default()
    };
    config.validate()?;

    let (jobs_tx, jobs_rx) = mpsc::channel(16);
    let service = SimulatedService {
        next_job: AtomicUsize::new(0),
        jobs_tx,
    };
    let (orchestrator, mut events) = UpdateOrchestrator::new(
        &config,
        Arc::new(service),
        Arc::new(MainsPower),
        probe_from_config(&config.probe),
    );
    let handle = orchestrator.handle();
    let worker = tokio::spawn(orchestrator.run());
    tokio::spawn(play_jobs(jobs_rx, handle.clone()));

    println!("🚀 升级流程模拟\n");
    handle.activate().await;
    handle.check_for_updates().await;

    while let Some(event) = events.recv().await {
        match event {
            UpdateEvent::StatusChanged(status) => {
                println!("状态: {status:?}");
                match status {
                    UpdateStatus::UpdatesAvailable => handle.download_and_dist_upgrade().await,
                    UpdateStatus::UpdateSucceeded | UpdateStatus::UpdateFailed => break,
                    _ => {}
                }
            }
            UpdateEvent::ProgressChanged(progress) => {
                println!("  进度: {:.0}%", progress * 100.0);
            }
            UpdateEvent::DownloadPlanChanged(plan) => {
                println!(
                    "下载计划: {} 项，共 {}",
                    plan.infos().len(),
                    ByteSize(plan.total_download_size())
                );
                for info in plan.infos() {
                    println!(
                        "  - {} {} -> {}",
                        info.name, info.current_version, info.available_version
                    );
                }
            }
            UpdateEvent::MirrorsChanged(mirrors) => {
                println!("镜像源: {} 个", mirrors.len());
            }
            _ => {}
        }
    }

    handle.shutdown().await;
    worker.await?;
    println!("\n✅ 模拟结束");
    Ok(())
}
