use std::collections::HashMap;
use tracing::debug;

use crate::types::{JobInfo, JobStatus, Phase};

/// 已挂载的外部任务
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: String,
    pub phase: Phase,
    pub status: JobStatus,
    pub progress: f64,
}

impl JobHandle {
    fn new(phase: Phase, info: &JobInfo) -> Self {
        Self {
            id: info.id.clone(),
            phase,
            status: JobStatus::Pending,
            progress: clamp_progress(info.progress),
        }
    }
}

/// 一次状态变化的结果
#[derive(Debug, Clone, PartialEq)]
pub struct JobTransition {
    pub phase: Phase,
    pub job_id: String,
    pub status: JobStatus,
    /// 该阶段的任务是否已被释放
    pub released: bool,
}

/// 计算单个阶段在收到新状态后的槽位
///
/// 成功和结束总是释放；失败时只有需要保留的阶段（下载）继续挂载。
pub fn transition(mut handle: JobHandle, status: JobStatus) -> Option<JobHandle> {
    handle.status = status;
    match status {
        JobStatus::Succeeded | JobStatus::Ended => None,
        JobStatus::Failed if !handle.phase.retains_failed_job() => None,
        _ => Some(handle),
    }
}

/// 每个阶段最多持有一个任务
#[derive(Debug, Default)]
pub struct JobTracker {
    slots: HashMap<Phase, JobHandle>,
    /// 已释放但服务端仍在列出的任务，以及释放时的状态
    finished: HashMap<String, (Phase, JobStatus)>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 挂载任务；该阶段已有任务，或该任务已经结束过时返回 `None`
    pub fn attach(&mut self, phase: Phase, info: &JobInfo) -> Option<&JobHandle> {
        if self.finished.contains_key(&info.id) {
            debug!(job = %info.id, "Job already finished, not attaching");
            return None;
        }
        if let Some(existing) = self.slots.get(&phase) {
            debug!(
                ?phase,
                attached = %existing.id,
                ignored = %info.id,
                "Phase already has a job attached"
            );
            return None;
        }
        Some(
            self.slots
                .entry(phase)
                .or_insert_with(|| JobHandle::new(phase, info)),
        )
    }

    pub fn get(&self, phase: Phase) -> Option<&JobHandle> {
        self.slots.get(&phase)
    }

    pub fn is_attached(&self, phase: Phase) -> bool {
        self.slots.contains_key(&phase)
    }

    /// 没有任何阶段挂载任务
    pub fn is_idle(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn phase_of(&self, job_id: &str) -> Option<Phase> {
        self.slots
            .values()
            .find(|handle| handle.id == job_id)
            .map(|handle| handle.phase)
    }

    /// 处理状态通知；终态会在返回之前先释放槽位
    pub fn on_status(&mut self, job_id: &str, status: JobStatus) -> Option<JobTransition> {
        let Some(phase) = self.phase_of(job_id) else {
            return self.on_finished_status(job_id, status);
        };
        let handle = self.slots.remove(&phase)?;
        let released = match transition(handle, status) {
            Some(handle) => {
                self.slots.insert(phase, handle);
                false
            }
            None => {
                self.finished.insert(job_id.to_string(), (phase, status));
                true
            }
        };
        Some(JobTransition {
            phase,
            job_id: job_id.to_string(),
            status,
            released,
        })
    }

    // 成功释放的任务之后只会再报告一次 end
    fn on_finished_status(&mut self, job_id: &str, status: JobStatus) -> Option<JobTransition> {
        if status != JobStatus::Ended {
            return None;
        }
        let (phase, finished_with) = self.finished.remove(job_id)?;
        (finished_with == JobStatus::Succeeded).then(|| JobTransition {
            phase,
            job_id: job_id.to_string(),
            status,
            released: true,
        })
    }

    /// 处理进度通知，返回所属阶段和截断后的进度
    pub fn on_progress(&mut self, job_id: &str, progress: f64) -> Option<(Phase, f64)> {
        let handle = self.slots.values_mut().find(|handle| handle.id == job_id)?;
        handle.progress = clamp_progress(progress);
        Some((handle.phase, handle.progress))
    }

    /// 释放服务端已不存在、且失败后被保留的任务
    ///
    /// 任务列表可能早于刚挂载的任务，所以仍在进行中的任务不会因为缺席而被释放。
    pub fn retain_listed(&mut self, listed: &[JobInfo]) -> Vec<JobHandle> {
        self.finished
            .retain(|id, _| listed.iter().any(|job| &job.id == id));
        let stale: Vec<Phase> = self
            .slots
            .values()
            .filter(|handle| handle.status == JobStatus::Failed)
            .filter(|handle| !listed.iter().any(|job| job.id == handle.id))
            .map(|handle| handle.phase)
            .collect();
        stale
            .into_iter()
            .filter_map(|phase| self.slots.remove(&phase))
            .collect()
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}
