//! 协调存储抽象
//!
//! 以 ZooKeeper 语义建模的层级键值树：原子创建临时节点、一次性子节点 watch、
//! 会话过期事件。ServerSet/Endpoint/Watch 只依赖这里的 trait，
//! 具体后端（内存实现、etcd）在子模块中实现。

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

pub use memory::MemoryStore;

#[cfg(feature = "etcd")]
pub use etcd::EtcdConnector;

/// 顺序节点后缀分隔符
///
/// 成员键编码时 `~` 被转义为 `%7E`，因此可以无歧义地剥离顺序后缀
pub const SEQUENCE_SEPARATOR: char = '~';

/// 节点创建模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// 持久节点（目录）
    Persistent,
    /// 临时节点，随会话结束自动删除
    Ephemeral,
    /// 临时顺序节点，存储在节点名后追加 `~` 与 10 位序号
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, CreateMode::Persistent)
    }

    pub fn is_sequential(&self) -> bool {
        matches!(self, CreateMode::EphemeralSequential)
    }
}

/// 会话事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    /// 会话已过期，该会话拥有的所有临时节点都已失效
    Expired,
}

/// 一次性 watch 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// 子节点集合发生变化
    ChildrenChanged { path: String },
    /// 被观察的节点本身被删除
    NodeDeleted { path: String },
}

/// 会话事件流
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// 一次性子节点 watch；发送端被丢弃表示所属会话已结束
pub type ChildrenWatch = oneshot::Receiver<WatchEvent>;

/// 协调存储连接
///
/// 每个连接对应一个会话；连接关闭或会话过期后，其创建的临时节点全部被删除
#[async_trait]
pub trait Connection: Send + Sync {
    /// 会话 ID
    fn session_id(&self) -> i64;

    /// 创建节点，返回实际创建的路径（顺序节点带序号后缀）
    ///
    /// 父节点不存在返回 `NoNode`，节点已存在返回 `NodeExists`
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// 删除节点，不存在返回 `NoNode`
    async fn delete(&self, path: &str) -> Result<()>;

    /// 读取节点数据，不存在返回 `NoNode`
    async fn get(&self, path: &str) -> Result<Vec<u8>>;

    /// 判断节点是否存在
    async fn exists(&self, path: &str) -> Result<bool>;

    /// 获取子节点名列表，并挂载一次性子节点 watch
    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ChildrenWatch)>;

    /// 关闭连接（幂等）
    async fn close(&self);
}

/// 协调存储连接器
#[async_trait]
pub trait Connector: Send + Sync {
    /// 建立一个新连接（新会话），同时返回该会话的事件流
    async fn connect(
        &self,
        addresses: &[String],
        session_timeout: Duration,
    ) -> Result<(Arc<dyn Connection>, SessionEvents)>;
}

/// 拼接父路径与子节点名
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// 获取父路径（根节点返回 None）
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// 获取路径最后一段节点名
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// 生成顺序节点路径
pub(crate) fn sequential_path(path: &str, sequence: u64) -> String {
    format!("{}{}{:010}", path, SEQUENCE_SEPARATOR, sequence)
}

/// 校验绝对路径：以 `/` 开头，不以 `/` 结尾（根节点除外），不含空段
pub fn validate_path(path: &str) -> Result<()> {
    let valid = path == "/"
        || (path.starts_with('/') && !path.ends_with('/') && !path[1..].split('/').any(str::is_empty));
    if valid {
        Ok(())
    } else {
        Err(crate::error::RegistryError::InvalidPath(path.to_string()))
    }
}
