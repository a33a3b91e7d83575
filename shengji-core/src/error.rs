use std::path::PathBuf;
use thiserror::Error;

/// 调用外部服务时的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    /// 服务返回了错误应答
    #[error("Request `{method}` failed: {message}")]
    RequestFailed { method: &'static str, message: String },

    /// 服务不可用（未连接或已断开）
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

impl ServiceError {
    pub fn request_failed(method: &'static str, message: impl Into<String>) -> Self {
        ServiceError::RequestFailed {
            method,
            message: message.into(),
        }
    }
}

/// 读取包元数据时的错误，只影响单个包
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Metadata file {path} is unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 镜像测速失败，最终按最差分数计
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Failed to launch probe tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Probe tool produced no usable score")]
    NoScore,

    #[error("HTTP probe failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
