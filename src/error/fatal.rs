//! 致命错误通道
//!
//! 后台协调任务（会话过期后的重连、存活状态翻转后的节点重建、watch 重新挂载）
//! 失败时不做静默重试，而是通过该通道把错误交给进程所有者处理
//! （崩溃、告警或重启由所有者决定）。

use chrono::{DateTime, Utc};
use std::fmt;
use tokio::sync::broadcast;
use tracing::error;

use super::RegistryError;

/// 致命错误通道容量
const FATAL_CHANNEL_CAPACITY: usize = 64;

/// 产生致命错误的组件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalSource {
    /// 注册端点（host:port）
    Endpoint { host: String, port: u16 },
    /// 目录观察者（目录路径）
    Watch { path: String },
}

impl fmt::Display for FatalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalSource::Endpoint { host, port } => write!(f, "endpoint {}:{}", host, port),
            FatalSource::Watch { path } => write!(f, "watch {}", path),
        }
    }
}

/// 后台协调失败
#[derive(Debug, Clone)]
pub struct FatalError {
    pub source: FatalSource,
    pub error: RegistryError,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed at {}: {}", self.source, self.timestamp, self.error)
    }
}

impl std::error::Error for FatalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 致命错误发布端
///
/// 所有属于同一 ServerSet 的 Endpoint 与 Watch 共享一个发布端
#[derive(Debug, Clone)]
pub struct FatalErrorSink {
    tx: broadcast::Sender<FatalError>,
}

impl FatalErrorSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FATAL_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 订阅致命错误
    pub fn subscribe(&self) -> broadcast::Receiver<FatalError> {
        self.tx.subscribe()
    }

    /// 发布致命错误
    ///
    /// 无论是否有订阅者都会记录 error 日志
    pub fn report(&self, source: FatalSource, err: RegistryError) {
        error!(source = %source, error = %err, "unrecoverable coordination failure");
        let fatal = FatalError {
            source,
            error: err,
            timestamp: Utc::now(),
        };
        if self.tx.send(fatal).is_err() {
            error!("no fatal error subscriber, failure only visible in logs");
        }
    }
}

impl Default for FatalErrorSink {
    fn default() -> Self {
        Self::new()
    }
}
