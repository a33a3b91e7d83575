use fs_err::tokio as fs;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// 安装成功、等待重启的标记文件
#[derive(Debug, Clone)]
pub struct RestartMarker {
    path: PathBuf,
}

impl RestartMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 创建空的标记文件，已存在时不做任何事
    ///
    /// 返回本次是否新建了文件。
    pub async fn mark(&self) -> std::io::Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }
}
