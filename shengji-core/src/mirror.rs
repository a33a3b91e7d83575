//! 镜像测速
//!
//! 每个镜像一个并发探测，结果按完成顺序逐条产出，界面可以先展示已完成的部分。
//! 探测失败不重试，直接记为 [`UNREACHABLE_SCORE`]。

use async_trait::async_trait;
use futures::{
    StreamExt,
    stream::{BoxStream, FuturesUnordered},
};
use reqwest::Client;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::{
    config::{ProbeBackend, ProbeConfig},
    error::ProbeError,
    types::{MirrorInfo, UNREACHABLE_SCORE},
};

/// 单个镜像的测速结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSpeed {
    pub mirror_id: String,
    pub score: u32,
}

/// 测速方式
#[async_trait]
pub trait SpeedProbe: Send + Sync {
    /// 返回分数，越小越快
    async fn measure(&self, url: &str) -> Result<u32, ProbeError>;
}

/// 取输出中第一个空白分隔的整数
pub fn parse_score(output: &str) -> Option<u32> {
    output.split_whitespace().next()?.parse().ok()
}

/// 调用外部测速工具，例如 `netselect <url> -s 1`
#[derive(Debug, Clone)]
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl SpeedProbe for CommandProbe {
    async fn measure(&self, url: &str) -> Result<u32, ProbeError> {
        let output = Command::new(&self.program)
            .arg(url)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!(url, output = %stdout.trim(), "Probe finished");
        parse_score(&stdout).ok_or(ProbeError::NoScore)
    }
}

/// 用 HEAD 请求的耗时（毫秒）作为分数
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SpeedProbe for HttpProbe {
    async fn measure(&self, url: &str) -> Result<u32, ProbeError> {
        let start = Instant::now();
        self.client.head(url).send().await?.error_for_status()?;
        let elapsed = start.elapsed().as_millis();
        Ok(elapsed.min(u128::from(UNREACHABLE_SCORE - 1)) as u32)
    }
}

/// 按配置选择测速方式，HTTP 客户端创建失败时退回外部工具
pub fn probe_from_config(config: &ProbeConfig) -> Arc<dyn SpeedProbe> {
    let command = || -> Arc<dyn SpeedProbe> {
        Arc::new(CommandProbe::new(&config.program, config.args.clone()))
    };
    match config.backend {
        ProbeBackend::Command => command(),
        ProbeBackend::Http => match HttpProbe::new(Duration::from_secs(config.http_timeout)) {
            Ok(probe) => Arc::new(probe),
            Err(e) => {
                warn!(error = %e, "HTTP probe unavailable, using probe tool");
                command()
            }
        },
    }
}

/// 镜像测速器
#[derive(Clone)]
pub struct MirrorProber {
    probe: Arc<dyn SpeedProbe>,
}

impl MirrorProber {
    pub fn new(probe: Arc<dyn SpeedProbe>) -> Self {
        Self { probe }
    }

    /// 并发测速所有镜像，每个镜像必定产出一条结果
    pub fn probe(&self, mirrors: Vec<MirrorInfo>) -> BoxStream<'static, MirrorSpeed> {
        mirrors
            .into_iter()
            .map(|mirror| {
                let probe = Arc::clone(&self.probe);
                async move {
                    let score = match probe.measure(&mirror.url).await {
                        Ok(score) => score,
                        Err(e) => {
                            warn!(mirror = %mirror.id, url = %mirror.url, error = %e, "Mirror probe failed");
                            UNREACHABLE_SCORE
                        }
                    };
                    MirrorSpeed {
                        mirror_id: mirror.id,
                        score,
                    }
                }
            })
            .collect::<FuturesUnordered<_>>()
            .boxed()
    }
}
