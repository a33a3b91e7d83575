//! 更新编排器
//!
//! 单个控制任务按顺序处理一个入站队列：用户命令、外部服务推送的通知，以及后台请求的应答。
//! 所有对外部服务的调用都在独立任务中执行，完成后把结果投递回队列，控制任务本身从不等待外部调用。
//!
//! ```text
//! UpdateHandle ──Command──┐
//! 服务推送 ──ServiceEvent──┼──► inbox ──► UpdateOrchestrator ──UpdateEvent──► UI
//! 后台请求 ────Reply──────┘                    │
//!         ▲                                    │ spawn
//!         └────────────────────────────────────┘
//! ```

use futures::StreamExt;
use std::{collections::HashSet, future::Future, ops::ControlFlow, sync::Arc};
use tokio::sync::{
    RwLock,
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::UpdateConfig,
    error::{ServiceError, ServiceResult},
    job::JobTracker,
    marker::RestartMarker,
    metadata::{Aggregation, MetadataStore},
    mirror::{MirrorProber, MirrorSpeed, SpeedProbe},
    plan::{DownloadPlan, plan_downloads},
    power::PowerGate,
    service::{PackageService, PowerService},
    types::{
        JobInfo, JobStatus, MirrorInfo, MirrorSpeedMap, Phase, ServiceEvent, UpdateEvent,
        UpdateModel, UpdateStatus,
    },
};

/// 先下载再安装时，安装阶段从 50% 开始
const DOWNLOAD_THEN_INSTALL_BASE: f64 = 0.5;

#[derive(Debug)]
enum Command {
    Activate,
    CheckForUpdates,
    DownloadAndDistUpgrade,
    DistUpgrade,
    PauseDownload,
    ResumeDownload,
    SetAutoDownloadUpdates(bool),
    SetAutoCleanCache(bool),
    SetMirrorSource(MirrorInfo),
    TestMirrorSpeed,
    Shutdown,
}

/// 更新列表刷新的结果
#[derive(Debug)]
enum Refresh {
    /// 拿不到应用更新信息
    InfosUnavailable,
    NeedRestart,
    Plan(DownloadPlan),
    Failed(ServiceError),
}

#[derive(Debug)]
enum Reply {
    JobCreated {
        phase: Phase,
        result: ServiceResult<JobInfo>,
    },
    Refreshed {
        refresh: Refresh,
        /// 只有检查更新触发的刷新才改变状态
        publish_status: bool,
    },
    Mirrors(Vec<MirrorInfo>),
    MirrorSpeed {
        round: u64,
        speed: MirrorSpeed,
    },
}

#[derive(Debug)]
enum Message {
    Command(Command),
    Event(ServiceEvent),
    Reply(Reply),
}

/// 编排器的命令入口，可以随意克隆
///
/// 所有命令都不返回错误，结果只通过 [`UpdateEvent`] 和 [`UpdateModel`] 体现。
#[derive(Clone)]
pub struct UpdateHandle {
    tx: mpsc::Sender<Message>,
    model: Arc<RwLock<UpdateModel>>,
}

impl UpdateHandle {
    async fn send(&self, message: Message) {
        if self.tx.send(message).await.is_err() {
            warn!("Update orchestrator is not running");
        }
    }

    async fn command(&self, command: Command) {
        self.send(Message::Command(command)).await;
    }

    /// 拉取镜像列表、各项开关、电源状态和当前任务列表，可重复调用
    pub async fn activate(&self) {
        self.command(Command::Activate).await;
    }

    /// 检查更新；任一阶段已有任务时不做任何事
    pub async fn check_for_updates(&self) {
        self.command(Command::CheckForUpdates).await;
    }

    /// 下载后自动安装，安装进度映射到 50% - 100%
    pub async fn download_and_dist_upgrade(&self) {
        self.command(Command::DownloadAndDistUpgrade).await;
    }

    /// 直接安装已下载的更新
    pub async fn dist_upgrade(&self) {
        self.command(Command::DistUpgrade).await;
    }

    pub async fn pause_download(&self) {
        self.command(Command::PauseDownload).await;
    }

    pub async fn resume_download(&self) {
        self.command(Command::ResumeDownload).await;
    }

    pub async fn set_auto_download_updates(&self, enable: bool) {
        self.command(Command::SetAutoDownloadUpdates(enable)).await;
    }

    pub async fn set_auto_clean_cache(&self, enable: bool) {
        self.command(Command::SetAutoCleanCache(enable)).await;
    }

    pub async fn set_mirror_source(&self, mirror: MirrorInfo) {
        self.command(Command::SetMirrorSource(mirror)).await;
    }

    /// 对当前已知的镜像列表测速
    pub async fn test_mirror_speed(&self) {
        self.command(Command::TestMirrorSpeed).await;
    }

    /// 投递外部服务的推送通知
    pub async fn notify(&self, event: ServiceEvent) {
        self.send(Message::Event(event)).await;
    }

    /// 当前状态快照
    pub async fn snapshot(&self) -> UpdateModel {
        self.model.read().await.clone()
    }

    /// 停止控制任务
    pub async fn shutdown(&self) {
        self.command(Command::Shutdown).await;
    }
}

/// 更新流程状态机
pub struct UpdateOrchestrator {
    service: Arc<dyn PackageService>,
    power_service: Arc<dyn PowerService>,
    prober: MirrorProber,
    store: MetadataStore,
    marker: RestartMarker,
    locale: String,
    jobs: JobTracker,
    /// 已发出、尚未拿到任务的请求
    pending: HashSet<Phase>,
    power: PowerGate,
    base_progress: f64,
    probe_round: u64,
    model: Arc<RwLock<UpdateModel>>,
    inbox: mpsc::Receiver<Message>,
    self_tx: mpsc::Sender<Message>,
    event_tx: mpsc::Sender<UpdateEvent>,
}

impl UpdateOrchestrator {
    /// 创建编排器
    ///
    /// # 返回
    /// 返回编排器和事件接收器，调用方需要 `tokio::spawn(orchestrator.run())`
    ///
    /// 接收器应当持续读取；积压满 `event_buffer` 条后新事件会被丢弃，
    /// 此时最新状态仍可以通过 [`UpdateHandle::snapshot`] 读取。
    pub fn new(
        config: &UpdateConfig,
        service: Arc<dyn PackageService>,
        power_service: Arc<dyn PowerService>,
        probe: Arc<dyn SpeedProbe>,
    ) -> (Self, mpsc::Receiver<UpdateEvent>) {
        let (self_tx, inbox) = mpsc::channel(config.event_buffer);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer);
        let power = PowerGate::new();
        let model = UpdateModel {
            low_battery: power.low_battery(),
            ..Default::default()
        };

        let orchestrator = Self {
            service,
            power_service,
            prober: MirrorProber::new(probe),
            store: MetadataStore::new(config),
            marker: RestartMarker::new(&config.restart_marker),
            locale: config.locale.clone(),
            jobs: JobTracker::new(),
            pending: HashSet::new(),
            power,
            base_progress: 0.0,
            probe_round: 0,
            model: Arc::new(RwLock::new(model)),
            inbox,
            self_tx,
            event_tx,
        };

        (orchestrator, event_rx)
    }

    pub fn handle(&self) -> UpdateHandle {
        UpdateHandle {
            tx: self.self_tx.clone(),
            model: Arc::clone(&self.model),
        }
    }

    /// 控制循环，直到收到停止命令
    pub async fn run(mut self) {
        info!("Update orchestrator started");
        while let Some(message) = self.inbox.recv().await {
            if self.dispatch(message).await.is_break() {
                break;
            }
        }
        info!("Update orchestrator stopped");
    }

    async fn dispatch(&mut self, message: Message) -> ControlFlow<()> {
        match message {
            Message::Command(Command::Shutdown) => return ControlFlow::Break(()),
            Message::Command(command) => self.on_command(command).await,
            Message::Event(event) => self.on_event(event).await,
            Message::Reply(reply) => self.on_reply(reply).await,
        }
        ControlFlow::Continue(())
    }

    /// 在后台执行请求，结果投递回队列
    fn spawn<F>(&self, request: F)
    where
        F: Future<Output = Option<Message>> + Send + 'static,
    {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            if let Some(message) = request.await {
                let _ = tx.send(message).await;
            }
        });
    }

    /// 后台读取一个值，失败时只记录日志
    fn spawn_fetch<T, F>(&self, what: &'static str, request: F, wrap: fn(T) -> ServiceEvent)
    where
        T: Send + 'static,
        F: Future<Output = ServiceResult<T>> + Send + 'static,
    {
        self.spawn(async move {
            match request.await {
                Ok(value) => Some(Message::Event(wrap(value))),
                Err(e) => {
                    warn!(what, error = %e, "Request failed");
                    None
                }
            }
        });
    }

    /// 后台发出不需要应答的调用
    fn spawn_call<F>(&self, what: &'static str, request: F)
    where
        F: Future<Output = ServiceResult<()>> + Send + 'static,
    {
        self.spawn(async move {
            if let Err(e) = request.await {
                warn!(what, error = %e, "Request failed");
            }
            None
        });
    }

    async fn on_command(&mut self, command: Command) {
        debug!(?command, "Command received");
        match command {
            Command::Activate => self.activate(),
            Command::CheckForUpdates => self.check_for_updates(),
            Command::DownloadAndDistUpgrade => {
                self.base_progress = DOWNLOAD_THEN_INSTALL_BASE;
                self.request_job(Phase::Download);
            }
            Command::DistUpgrade => {
                self.base_progress = 0.0;
                self.request_job(Phase::DistUpgrade);
            }
            Command::PauseDownload => self.pause_download().await,
            Command::ResumeDownload => self.resume_download().await,
            Command::SetAutoDownloadUpdates(enable) => {
                let service = Arc::clone(&self.service);
                self.spawn_call("set_auto_download_updates", async move {
                    service.set_auto_download_updates(enable).await
                });
            }
            Command::SetAutoCleanCache(enable) => {
                let service = Arc::clone(&self.service);
                self.spawn_call("set_auto_clean", async move {
                    service.set_auto_clean(enable).await
                });
            }
            Command::SetMirrorSource(mirror) => {
                let service = Arc::clone(&self.service);
                self.spawn_call("set_mirror_source", async move {
                    service.set_mirror_source(&mirror.id).await
                });
            }
            Command::TestMirrorSpeed => self.test_mirror_speed().await,
            Command::Shutdown => {}
        }
    }

    fn activate(&self) {
        let service = Arc::clone(&self.service);
        let locale = self.locale.clone();
        self.spawn(async move {
            match service.list_mirror_sources(&locale).await {
                Ok(mirrors) => Some(Message::Reply(Reply::Mirrors(mirrors))),
                Err(e) => {
                    warn!(error = %e, "Failed to list mirror sources");
                    None
                }
            }
        });

        let service = Arc::clone(&self.service);
        self.spawn_fetch(
            "mirror_source",
            async move { service.mirror_source().await },
            ServiceEvent::MirrorSourceChanged,
        );
        let service = Arc::clone(&self.service);
        self.spawn_fetch(
            "auto_clean",
            async move { service.auto_clean().await },
            ServiceEvent::AutoCleanChanged,
        );
        let service = Arc::clone(&self.service);
        self.spawn_fetch(
            "auto_download_updates",
            async move { service.auto_download_updates().await },
            ServiceEvent::AutoDownloadUpdatesChanged,
        );
        let power = Arc::clone(&self.power_service);
        self.spawn_fetch(
            "on_battery",
            async move { power.on_battery().await },
            ServiceEvent::OnBatteryChanged,
        );
        let power = Arc::clone(&self.power_service);
        self.spawn_fetch(
            "battery_percentage",
            async move { power.battery_percentage().await },
            ServiceEvent::BatteryPercentageChanged,
        );
        let service = Arc::clone(&self.service);
        self.spawn_fetch(
            "job_list",
            async move { service.job_list().await },
            ServiceEvent::JobListChanged,
        );
    }

    fn check_for_updates(&mut self) {
        if !self.jobs.is_idle() || !self.pending.is_empty() {
            debug!("Update job in progress, ignoring check request");
            return;
        }
        self.request_job(Phase::CheckSource);
    }

    #[instrument(skip(self))]
    fn request_job(&mut self, phase: Phase) {
        if self.jobs.is_attached(phase) || !self.pending.insert(phase) {
            debug!("Job already attached or requested");
            return;
        }

        let service = Arc::clone(&self.service);
        self.spawn(async move {
            let result = match phase {
                Phase::CheckSource => service.update_source().await,
                Phase::Download => service.prepare_dist_upgrade().await,
                Phase::DistUpgrade => service.dist_upgrade().await,
            };
            Some(Message::Reply(Reply::JobCreated { phase, result }))
        });
    }

    async fn pause_download(&mut self) {
        let Some(job) = self.jobs.get(Phase::Download) else {
            debug!("No download job to pause");
            return;
        };
        let (service, id) = (Arc::clone(&self.service), job.id.clone());
        self.spawn_call("pause_job", async move { service.pause_job(&id).await });
        self.set_status(UpdateStatus::DownloadPaused).await;
    }

    async fn resume_download(&mut self) {
        let Some(job) = self.jobs.get(Phase::Download) else {
            debug!("No download job to resume");
            return;
        };
        let (service, id) = (Arc::clone(&self.service), job.id.clone());
        self.spawn_call("start_job", async move { service.start_job(&id).await });
        self.set_status(UpdateStatus::Downloading).await;
    }

    async fn test_mirror_speed(&mut self) {
        self.probe_round += 1;
        let round = self.probe_round;
        self.set_mirror_speeds(MirrorSpeedMap::new()).await;

        let mirrors = self.model.read().await.mirrors.clone();
        info!(round, mirrors = mirrors.len(), "Testing mirror speed");
        let mut speeds = self.prober.probe(mirrors);
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            while let Some(speed) = speeds.next().await {
                let reply = Reply::MirrorSpeed { round, speed };
                if tx.send(Message::Reply(reply)).await.is_err() {
                    break;
                }
            }
        });
    }

    /// 重新拉取更新信息并生成下载计划
    fn refresh(&self, publish_status: bool) {
        let service = Arc::clone(&self.service);
        let store = self.store.clone();
        let marker = self.marker.clone();
        let locale = self.locale.clone();
        self.spawn(async move {
            let refresh = Self::build_plan(service, store, marker, locale).await;
            Some(Message::Reply(Reply::Refreshed {
                refresh,
                publish_status,
            }))
        });
    }

    async fn build_plan(
        service: Arc<dyn PackageService>,
        store: MetadataStore,
        marker: RestartMarker,
        locale: String,
    ) -> Refresh {
        let records = match service.application_update_infos(&locale).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Update infos unavailable");
                return Refresh::InfosUnavailable;
            }
        };
        let packages = match service.updatable_packages().await {
            Ok(packages) => packages,
            Err(e) => return Refresh::Failed(e),
        };
        debug!(
            apps = records.len(),
            packages = packages.len(),
            "Updatable"
        );

        match store.aggregate(&records, &packages, &marker).await {
            Aggregation::NeedRestart => Refresh::NeedRestart,
            Aggregation::Updates(infos) => {
                match plan_downloads(service.as_ref(), &packages, infos).await {
                    Ok(plan) => Refresh::Plan(plan),
                    Err(e) => Refresh::Failed(e),
                }
            }
        }
    }

    async fn on_reply(&mut self, reply: Reply) {
        match reply {
            Reply::JobCreated { phase, result } => {
                self.pending.remove(&phase);
                match result {
                    Ok(job) => self.attach_job(phase, job).await,
                    Err(e) => {
                        warn!(?phase, error = %e, "Failed to create job");
                        if phase != Phase::CheckSource {
                            self.set_status(UpdateStatus::UpdateFailed).await;
                        }
                    }
                }
            }
            Reply::Refreshed {
                refresh,
                publish_status,
            } => self.apply_refresh(refresh, publish_status).await,
            Reply::Mirrors(mirrors) => {
                self.model.write().await.mirrors = mirrors.clone();
                self.emit(UpdateEvent::MirrorsChanged(mirrors));
            }
            Reply::MirrorSpeed { round, speed } => {
                if round != self.probe_round {
                    debug!(round, mirror = %speed.mirror_id, "Dropping stale probe result");
                    return;
                }
                let mut speeds = self.model.read().await.mirror_speeds.clone();
                speeds.insert(speed.mirror_id, speed.score);
                self.set_mirror_speeds(speeds).await;
            }
        }
    }

    /// 有任务存在时，任务自身的状态优先于计划推导出的状态
    async fn apply_refresh(&mut self, refresh: Refresh, publish_status: bool) {
        let job_owns_status = !publish_status
            || Phase::ALL
                .iter()
                .any(|phase| self.jobs.is_attached(*phase) || self.pending.contains(phase));

        let status = match refresh {
            Refresh::InfosUnavailable => UpdateStatus::Updated,
            Refresh::NeedRestart => {
                info!("Nothing to update, restart pending");
                UpdateStatus::NeedRestart
            }
            Refresh::Plan(plan) => {
                let plan = Arc::new(plan);
                let status = plan.status();
                self.model.write().await.plan = Some(Arc::clone(&plan));
                self.emit(UpdateEvent::DownloadPlanChanged(plan));
                status
            }
            Refresh::Failed(e) => {
                warn!(error = %e, "Failed to build download plan");
                UpdateStatus::UpdateFailed
            }
        };

        if !job_owns_status {
            self.set_status(status).await;
        }
    }

    async fn on_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::JobListChanged(jobs) => {
                for job in self.jobs.retain_listed(&jobs) {
                    info!(job = %job.id, phase = ?job.phase, "Job no longer listed, released");
                }
                for job in jobs {
                    let phase = Phase::from_job_type(&job.job_type);
                    self.attach_job(phase, job).await;
                }
            }
            ServiceEvent::JobStatusChanged { job_id, status } => {
                self.on_job_status(&job_id, JobStatus::from_wire(&status))
                    .await;
            }
            ServiceEvent::JobProgressChanged { job_id, progress } => {
                self.on_job_progress(&job_id, progress).await;
            }
            ServiceEvent::JobTypeChanged { job_id, job_type } => {
                debug!(job = %job_id, job_type = %job_type, "Job type changed");
            }
            ServiceEvent::AutoCleanChanged(enable) => {
                self.model.write().await.auto_clean = enable;
                self.emit(UpdateEvent::AutoCleanChanged(enable));
            }
            ServiceEvent::AutoDownloadUpdatesChanged(enable) => {
                self.model.write().await.auto_download = enable;
                self.emit(UpdateEvent::AutoDownloadUpdatesChanged(enable));
            }
            ServiceEvent::MirrorSourceChanged(id) => {
                self.model.write().await.default_mirror = id.clone();
                self.emit(UpdateEvent::DefaultMirrorChanged(id));
            }
            ServiceEvent::OnBatteryChanged(on_battery) => {
                let low = self.power.set_on_battery(on_battery);
                self.set_low_battery(low).await;
            }
            ServiceEvent::BatteryPercentageChanged(percentage) => {
                let low = self.power.set_battery_percentage(percentage);
                self.set_low_battery(low).await;
            }
        }
    }

    async fn attach_job(&mut self, phase: Phase, job: JobInfo) {
        if self.jobs.attach(phase, &job).is_none() {
            return;
        }
        info!(?phase, job = %job.id, "Job attached");

        match phase {
            Phase::CheckSource => self.set_status(UpdateStatus::Checking).await,
            Phase::Download | Phase::DistUpgrade => self.refresh(false),
        }

        // 恢复已有任务时按当前进度和状态重放一次
        self.on_job_progress(&job.id, job.progress).await;
        self.on_job_status(&job.id, JobStatus::from_wire(&job.status))
            .await;
    }

    async fn on_job_status(&mut self, job_id: &str, status: JobStatus) {
        let Some(transition) = self.jobs.on_status(job_id, status) else {
            debug!(job = job_id, ?status, "Status for untracked job");
            return;
        };
        debug!(job = job_id, phase = ?transition.phase, ?status, "Job status changed");

        match transition.phase {
            Phase::CheckSource => match status {
                JobStatus::Failed => {
                    warn!(job = job_id, "Check for updates job failed");
                    self.clean_job(job_id);
                    self.set_status(UpdateStatus::UpdateFailed).await;
                }
                JobStatus::Succeeded => {
                    info!("Update source refreshed");
                    self.refresh(true);
                }
                _ => {}
            },
            Phase::Download => match status {
                // 下载失败不清理，留给用户重试
                JobStatus::Failed => {
                    warn!(job = job_id, "Download updates job failed");
                    self.set_status(UpdateStatus::UpdateFailed).await;
                }
                JobStatus::Succeeded => {
                    info!("Updates downloaded, installing");
                    self.request_job(Phase::DistUpgrade);
                }
                JobStatus::Ended => {}
                JobStatus::Paused => self.set_status(UpdateStatus::DownloadPaused).await,
                JobStatus::Pending | JobStatus::Running => {
                    self.set_status(UpdateStatus::Downloading).await
                }
            },
            Phase::DistUpgrade => match status {
                JobStatus::Failed => {
                    warn!(job = job_id, "Install updates job failed");
                    self.clean_job(job_id);
                    self.set_status(UpdateStatus::UpdateFailed).await;
                }
                JobStatus::Succeeded => {
                    self.write_restart_marker().await;
                    self.set_status(UpdateStatus::UpdateSucceeded).await;
                }
                JobStatus::Ended => self.set_status(UpdateStatus::Updated).await,
                JobStatus::Pending | JobStatus::Running | JobStatus::Paused => {
                    self.set_status(UpdateStatus::Installing).await
                }
            },
        }
    }

    async fn on_job_progress(&mut self, job_id: &str, progress: f64) {
        let Some((phase, progress)) = self.jobs.on_progress(job_id, progress) else {
            return;
        };
        match phase {
            Phase::CheckSource => {}
            Phase::Download => {
                self.model.write().await.download_progress = progress;
                self.emit(UpdateEvent::DownloadProgressChanged(progress));
                self.set_progress(progress).await;
            }
            Phase::DistUpgrade => {
                let overall = self.base_progress + (1.0 - self.base_progress) * progress;
                self.set_progress(overall).await;
            }
        }
    }

    fn clean_job(&self, job_id: &str) {
        let (service, id) = (Arc::clone(&self.service), job_id.to_string());
        self.spawn_call("clean_job", async move { service.clean_job(&id).await });
    }

    async fn write_restart_marker(&self) {
        match self.marker.mark().await {
            Ok(true) => info!(path = %self.marker.path().display(), "Restart marker written"),
            Ok(false) => debug!("Restart marker already present"),
            Err(e) => warn!(error = %e, "Failed to write restart marker"),
        }
    }

    /// 接收端跟不上时丢弃事件，控制循环不会因此停住
    fn emit(&self, event: UpdateEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event receiver is lagging, event dropped");
            }
        }
    }

    async fn set_status(&mut self, status: UpdateStatus) {
        {
            let mut model = self.model.write().await;
            if model.status == status {
                return;
            }
            model.status = status;
        }
        info!(?status, "Update status changed");
        self.emit(UpdateEvent::StatusChanged(status));
    }

    async fn set_progress(&mut self, progress: f64) {
        self.model.write().await.progress = progress;
        self.emit(UpdateEvent::ProgressChanged(progress));
    }

    /// 整体替换测速结果
    async fn set_mirror_speeds(&mut self, speeds: MirrorSpeedMap) {
        self.model.write().await.mirror_speeds = speeds.clone();
        self.emit(UpdateEvent::MirrorSpeedChanged(speeds));
    }

    async fn set_low_battery(&mut self, low: bool) {
        {
            let mut model = self.model.write().await;
            if model.low_battery == low {
                return;
            }
            model.low_battery = low;
        }
        info!(low_battery = low, "Power state changed");
        self.emit(UpdateEvent::LowBatteryChanged(low));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ProbeError,
        testing::{FakePower, FakeService},
        types::{AppUpdateRecord, UNREACHABLE_SCORE},
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::timeout;

    struct FixedProbe;

    #[async_trait]
    impl SpeedProbe for FixedProbe {
        async fn measure(&self, url: &str) -> Result<u32, ProbeError> {
            match url {
                "http://slow" => Ok(800),
                "http://fast" => Ok(20),
                _ => Err(ProbeError::NoScore),
            }
        }
    }

    struct Harness {
        handle: UpdateHandle,
        events: mpsc::Receiver<UpdateEvent>,
        service: Arc<FakeService>,
        marker: RestartMarker,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn start(service: FakeService) -> Self {
            Self::with_event_buffer(service, UpdateConfig::default().event_buffer)
        }

        fn with_event_buffer(service: FakeService, event_buffer: usize) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = UpdateConfig {
                locale: "en_US".to_string(),
                metadata_dir: dir.path().join("metadata"),
                install_log: dir.path().join("update_infos.json"),
                restart_marker: dir.path().join("restart-pending"),
                event_buffer,
                ..Default::default()
            };
            let service = Arc::new(service);
            let power = Arc::new(FakePower {
                on_battery: true,
                percentage: 30.0,
            });
            let (orchestrator, events) =
                UpdateOrchestrator::new(&config, service.clone(), power, Arc::new(FixedProbe));
            let handle = orchestrator.handle();
            tokio::spawn(orchestrator.run());

            Self {
                handle,
                events,
                service,
                marker: RestartMarker::new(&config.restart_marker),
                _dir: dir,
            }
        }

        async fn wait_for<F>(&mut self, mut pred: F) -> UpdateEvent
        where
            F: FnMut(&UpdateEvent) -> bool,
        {
            timeout(Duration::from_secs(5), async {
                loop {
                    let event = self.events.recv().await.expect("event channel closed");
                    if pred(&event) {
                        return event;
                    }
                }
            })
            .await
            .expect("timed out waiting for event")
        }

        async fn wait_for_status(&mut self, status: UpdateStatus) {
            self.wait_for(|e| matches!(e, UpdateEvent::StatusChanged(s) if *s == status))
                .await;
        }

        async fn wait_for_progress(&mut self) -> f64 {
            match self
                .wait_for(|e| matches!(e, UpdateEvent::ProgressChanged(_)))
                .await
            {
                UpdateEvent::ProgressChanged(p) => p,
                _ => unreachable!(),
            }
        }

        async fn status(&self, job_id: &str, status: &str) {
            self.handle
                .notify(ServiceEvent::JobStatusChanged {
                    job_id: job_id.to_string(),
                    status: status.to_string(),
                })
                .await;
        }

        async fn progress(&self, job_id: &str, progress: f64) {
            self.handle
                .notify(ServiceEvent::JobProgressChanged {
                    job_id: job_id.to_string(),
                    progress,
                })
                .await;
        }

        /// 让后台请求有机会完成
        async fn settle(&self) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn job(id: &str, job_type: &str, status: &str) -> JobInfo {
        JobInfo {
            id: id.to_string(),
            job_type: job_type.to_string(),
            status: status.to_string(),
            progress: 0.0,
        }
    }

    fn app(id: &str) -> AppUpdateRecord {
        AppUpdateRecord {
            package_id: id.to_string(),
            name: id.to_string(),
            current_version: "1.0".to_string(),
            available_version: "2.0".to_string(),
        }
    }

    fn service_with_updates(apps: usize, packages: usize, size: u64) -> FakeService {
        let service = FakeService::new();
        *service.records.lock().unwrap() = (0..apps).map(|i| app(&format!("app{i}"))).collect();
        *service.packages.lock().unwrap() = (0..packages).map(|i| format!("pkg{i}")).collect();
        *service.download_size.lock().unwrap() = size;
        service
    }

    #[tokio::test]
    async fn test_check_publishes_plan_and_status() {
        let mut h = Harness::start(service_with_updates(3, 5, 4096));

        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "succeed").await;

        let plan = match h
            .wait_for(|e| matches!(e, UpdateEvent::DownloadPlanChanged(_)))
            .await
        {
            UpdateEvent::DownloadPlanChanged(plan) => plan,
            _ => unreachable!(),
        };
        assert_eq!(plan.infos().len(), 4);
        assert_eq!(plan.infos()[0].package_id, "dde");
        assert_eq!(plan.total_download_size(), 4096);
        h.wait_for_status(UpdateStatus::UpdatesAvailable).await;
        assert!(h.service.called_with("application_update_infos:en_US"));
        assert_eq!(h.service.calls("updatable_apps"), 0);
    }

    #[tokio::test]
    async fn test_check_resolves_downloaded_and_updated() {
        let mut h = Harness::start(service_with_updates(1, 1, 0));
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "success").await;
        h.wait_for_status(UpdateStatus::Downloaded).await;

        let mut h = Harness::start(service_with_updates(0, 0, 0));
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "success").await;
        h.wait_for_status(UpdateStatus::Updated).await;
    }

    #[tokio::test]
    async fn test_check_is_noop_while_any_phase_active() {
        let mut h = Harness::start(FakeService::new());
        h.handle
            .notify(ServiceEvent::JobListChanged(vec![job("dl", "download", "running")]))
            .await;
        h.wait_for_status(UpdateStatus::Downloading).await;

        h.handle.check_for_updates().await;
        h.settle().await;
        assert_eq!(h.service.calls("update_source"), 0);
        assert_eq!(h.handle.snapshot().await.status, UpdateStatus::Downloading);
    }

    #[tokio::test]
    async fn test_repeated_check_issues_one_request() {
        let mut h = Harness::start(FakeService::new());
        h.handle.check_for_updates().await;
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.handle.check_for_updates().await;
        h.settle().await;
        assert_eq!(h.service.calls("update_source"), 1);
    }

    #[tokio::test]
    async fn test_failed_check_is_cleaned_and_phase_freed() {
        let mut h = Harness::start(FakeService::new());
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "failed").await;
        h.wait_for_status(UpdateStatus::UpdateFailed).await;
        h.settle().await;
        assert!(h.service.called_with("clean_job:update_source-1"));

        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        assert_eq!(h.service.calls("update_source"), 2);
    }

    #[tokio::test]
    async fn test_no_updates_with_marker_needs_restart() {
        let mut h = Harness::start(FakeService::new());
        h.marker.mark().await.unwrap();

        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "success").await;
        h.wait_for_status(UpdateStatus::NeedRestart).await;
        assert!(h.handle.snapshot().await.plan.is_none());
        assert_eq!(h.service.calls("packages_download_size"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_infos_resolve_to_updated() {
        let service = FakeService::new();
        service.fail("application_update_infos");
        let mut h = Harness::start(service);

        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
        h.status("update_source-1", "success").await;
        h.wait_for_status(UpdateStatus::Updated).await;
    }

    #[tokio::test]
    async fn test_download_success_chains_install() {
        let mut h = Harness::start(service_with_updates(1, 1, 1024));
        h.handle
            .notify(ServiceEvent::JobListChanged(vec![job("dl", "download", "running")]))
            .await;
        h.wait_for_status(UpdateStatus::Downloading).await;

        h.status("dl", "success").await;
        h.wait_for_status(UpdateStatus::Installing).await;
        assert_eq!(h.service.calls("dist_upgrade"), 1);
    }

    #[tokio::test]
    async fn test_download_then_install_progress_is_blended() {
        let mut h = Harness::start(service_with_updates(1, 1, 1024));
        h.handle.download_and_dist_upgrade().await;
        h.wait_for_status(UpdateStatus::Downloading).await;

        h.status("download-1", "success").await;
        h.wait_for_status(UpdateStatus::Installing).await;
        h.progress("dist_upgrade-2", 0.5).await;
        loop {
            if (h.wait_for_progress().await - 0.75).abs() < 1e-9 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_install_only_progress_is_raw() {
        let mut h = Harness::start(FakeService::new());
        h.handle.dist_upgrade().await;
        h.wait_for_status(UpdateStatus::Installing).await;

        h.progress("dist_upgrade-1", 0.5).await;
        loop {
            if (h.wait_for_progress().await - 0.5).abs() < 1e-9 {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_install_success_writes_marker_then_end_is_updated() {
        let mut h = Harness::start(FakeService::new());
        h.handle.dist_upgrade().await;
        h.wait_for_status(UpdateStatus::Installing).await;

        h.status("dist_upgrade-1", "succeed").await;
        h.wait_for_status(UpdateStatus::UpdateSucceeded).await;
        assert!(h.marker.exists());

        h.status("dist_upgrade-1", "end").await;
        h.wait_for_status(UpdateStatus::Updated).await;
        assert!(h.marker.exists());
    }

    #[tokio::test]
    async fn test_failed_install_is_cleaned_but_failed_download_is_not() {
        let mut h = Harness::start(FakeService::new());
        h.handle.dist_upgrade().await;
        h.wait_for_status(UpdateStatus::Installing).await;
        h.status("dist_upgrade-1", "failed").await;
        h.wait_for_status(UpdateStatus::UpdateFailed).await;
        h.settle().await;
        assert!(h.service.called_with("clean_job:dist_upgrade-1"));

        let mut h = Harness::start(FakeService::new());
        h.handle.download_and_dist_upgrade().await;
        h.wait_for_status(UpdateStatus::Downloading).await;
        h.status("download-1", "failed").await;
        h.wait_for_status(UpdateStatus::UpdateFailed).await;
        h.settle().await;
        assert_eq!(h.service.calls("clean_job"), 0);

        // 失败的下载仍然挂载，可以直接恢复
        h.handle.resume_download().await;
        h.wait_for_status(UpdateStatus::Downloading).await;
        h.settle().await;
        assert!(h.service.called_with("start_job:download-1"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_are_optimistic() {
        let mut h = Harness::start(FakeService::new());
        h.handle.pause_download().await;
        h.settle().await;
        assert_eq!(h.service.calls("pause_job"), 0);

        h.handle
            .notify(ServiceEvent::JobListChanged(vec![job("dl", "download", "running")]))
            .await;
        h.wait_for_status(UpdateStatus::Downloading).await;

        h.handle.pause_download().await;
        h.wait_for_status(UpdateStatus::DownloadPaused).await;
        h.handle.resume_download().await;
        h.wait_for_status(UpdateStatus::Downloading).await;
        h.settle().await;
        assert!(h.service.called_with("pause_job:dl"));
        assert!(h.service.called_with("start_job:dl"));
    }

    #[tokio::test]
    async fn test_download_request_failure_is_update_failed() {
        let service = FakeService::new();
        service.fail("prepare_dist_upgrade");
        let mut h = Harness::start(service);
        h.handle.download_and_dist_upgrade().await;
        h.wait_for_status(UpdateStatus::UpdateFailed).await;
    }

    #[tokio::test]
    async fn test_vanished_job_frees_phase() {
        let mut h = Harness::start(FakeService::new());
        h.handle
            .notify(ServiceEvent::JobListChanged(vec![job("dl", "download", "failed")]))
            .await;
        h.wait_for_status(UpdateStatus::UpdateFailed).await;

        h.handle.notify(ServiceEvent::JobListChanged(Vec::new())).await;
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;
    }

    #[tokio::test]
    async fn test_activate_loads_settings_and_power() {
        let service = FakeService::new();
        service.fail("list_mirror_sources");
        let mut h = Harness::start(service);
        assert!(h.handle.snapshot().await.low_battery);

        h.handle.activate().await;
        h.wait_for(|e| matches!(e, UpdateEvent::DefaultMirrorChanged(_)))
            .await;
        h.settle().await;

        let model = h.handle.snapshot().await;
        assert!(model.low_battery);
        assert!(model.auto_clean);
        assert!(model.auto_download);
        assert_eq!(model.default_mirror, "default");
        assert!(model.mirrors.is_empty());
        assert_eq!(h.service.calls("job_list"), 1);

        h.handle
            .notify(ServiceEvent::BatteryPercentageChanged(50.0))
            .await;
        h.wait_for(|e| matches!(e, UpdateEvent::LowBatteryChanged(false)))
            .await;
    }

    #[tokio::test]
    async fn test_late_job_list_keeps_new_check_job() {
        let service = service_with_updates(3, 5, 4096);
        *service.job_list_delay.lock().unwrap() = Duration::from_millis(200);
        let mut h = Harness::start(service);

        h.handle.activate().await;
        h.handle.check_for_updates().await;
        h.wait_for_status(UpdateStatus::Checking).await;

        // 等待发起于检查之前的空任务列表到达
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.handle.snapshot().await.status, UpdateStatus::Checking);

        h.status("update_source-1", "success").await;
        h.wait_for_status(UpdateStatus::UpdatesAvailable).await;
    }

    #[tokio::test]
    async fn test_undrained_events_do_not_block_commands() {
        let h = Harness::with_event_buffer(FakeService::new(), 16);
        h.handle
            .notify(ServiceEvent::JobListChanged(vec![job("dl", "download", "running")]))
            .await;

        let steps = 3000;
        timeout(Duration::from_secs(5), async {
            for step in 1..=steps {
                h.progress("dl", f64::from(step) / f64::from(steps)).await;
            }
        })
        .await
        .expect("notifications stalled");

        let model = timeout(Duration::from_secs(5), async {
            loop {
                let model = h.handle.snapshot().await;
                if model.progress == 1.0 {
                    return model;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("progress never reached the end");
        assert_eq!(model.download_progress, 1.0);
        assert_eq!(model.status, UpdateStatus::Downloading);
    }

    #[tokio::test]
    async fn test_mirror_speed_reports_every_mirror() {
        let service = FakeService::new();
        *service.mirrors.lock().unwrap() = ["http://fast", "http://slow", "http://down"]
            .iter()
            .enumerate()
            .map(|(i, url)| MirrorInfo {
                id: format!("m{i}"),
                name: url.to_string(),
                url: url.to_string(),
            })
            .collect();
        let mut h = Harness::start(service);

        h.handle.activate().await;
        h.wait_for(|e| matches!(e, UpdateEvent::MirrorsChanged(m) if m.len() == 3))
            .await;

        h.handle.test_mirror_speed().await;
        let speeds = match h
            .wait_for(|e| matches!(e, UpdateEvent::MirrorSpeedChanged(s) if s.len() == 3))
            .await
        {
            UpdateEvent::MirrorSpeedChanged(speeds) => speeds,
            _ => unreachable!(),
        };
        assert_eq!(speeds["m0"], 20);
        assert_eq!(speeds["m1"], 800);
        assert_eq!(speeds["m2"], UNREACHABLE_SCORE);
    }

    #[tokio::test]
    async fn test_settings_are_passed_through() {
        let h = Harness::start(FakeService::new());
        h.handle.set_auto_download_updates(false).await;
        h.handle.set_auto_clean_cache(true).await;
        h.handle
            .set_mirror_source(MirrorInfo {
                id: "tuna".to_string(),
                name: "TUNA".to_string(),
                url: "https://mirrors.tuna.tsinghua.edu.cn".to_string(),
            })
            .await;
        h.settle().await;

        assert!(h.service.called_with("set_auto_download_updates:false"));
        assert!(h.service.called_with("set_auto_clean:true"));
        assert!(h.service.called_with("set_mirror_source:tuna"));
        assert_eq!(h.handle.snapshot().await.status, UpdateStatus::Updated);
    }
}
