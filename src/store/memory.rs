//! 内存协调存储
//!
//! 在进程内完整模拟 ZooKeeper 语义：持久/临时/顺序节点、按会话归属的临时节点、
//! 一次性子节点 watch，以及可注入的会话过期和不可达状态。
//! 主要用于测试和单进程嵌入场景。

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{
    ChildrenWatch, Connection, Connector, CreateMode, SessionEvent, SessionEvents, WatchEvent,
    parent_path, sequential_path, validate_path,
};
use crate::error::{RegistryError, Result};

/// 进程内共享的协调存储
///
/// 克隆得到的是同一棵树的句柄
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

struct Node {
    data: Vec<u8>,
    ephemeral_owner: Option<i64>,
    next_sequence: u64,
}

impl Node {
    fn new(data: Vec<u8>, ephemeral_owner: Option<i64>) -> Self {
        Self {
            data,
            ephemeral_owner,
            next_sequence: 0,
        }
    }
}

struct Watcher {
    session_id: i64,
    tx: oneshot::Sender<WatchEvent>,
}

struct Session {
    events: mpsc::UnboundedSender<SessionEvent>,
    expired: bool,
}

struct Tree {
    nodes: BTreeMap<String, Node>,
    watchers: HashMap<String, Vec<Watcher>>,
    sessions: HashMap<i64, Session>,
    next_session_id: i64,
    reachable: bool,
}

impl Default for Tree {
    fn default() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Vec::new(), None));
        Self {
            nodes,
            watchers: HashMap::new(),
            sessions: HashMap::new(),
            next_session_id: 1,
            reachable: true,
        }
    }
}

impl Tree {
    fn check_session(&self, session_id: i64) -> Result<()> {
        match self.sessions.get(&session_id) {
            None => Err(RegistryError::ConnectionClosed),
            Some(session) if session.expired => Err(RegistryError::SessionExpired),
            Some(_) => Ok(()),
        }
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(watchers) = self.watchers.remove(path) {
            for watcher in watchers {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }

    fn fire_children_changed(&mut self, parent: &str) {
        self.fire(
            parent,
            WatchEvent::ChildrenChanged {
                path: parent.to_string(),
            },
        );
    }

    fn remove_node(&mut self, path: &str) {
        if self.nodes.remove(path).is_none() {
            return;
        }
        self.fire(
            path,
            WatchEvent::NodeDeleted {
                path: path.to_string(),
            },
        );
        if let Some(parent) = parent_path(path) {
            let parent = parent.to_string();
            self.fire_children_changed(&parent);
        }
    }

    fn create(&mut self, session_id: i64, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_session(session_id)?;
        validate_path(path)?;
        let parent = parent_path(path)
            .ok_or_else(|| RegistryError::NodeExists(path.to_string()))?
            .to_string();

        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| RegistryError::NoNode(parent.clone()))?;
        if parent_node.ephemeral_owner.is_some() {
            return Err(RegistryError::Store(format!(
                "ephemeral node {} may not have children",
                parent
            )));
        }

        let actual = if mode.is_sequential() {
            let sequence = parent_node.next_sequence;
            parent_node.next_sequence += 1;
            sequential_path(path, sequence)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&actual) {
            return Err(RegistryError::NodeExists(actual));
        }

        let owner = mode.is_ephemeral().then_some(session_id);
        self.nodes
            .insert(actual.clone(), Node::new(data.to_vec(), owner));
        self.fire_children_changed(&parent);
        Ok(actual)
    }

    fn delete(&mut self, session_id: i64, path: &str) -> Result<()> {
        self.check_session(session_id)?;
        validate_path(path)?;
        if path == "/" {
            return Err(RegistryError::InvalidPath(path.to_string()));
        }
        if !self.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        if !self.children_of(path).is_empty() {
            return Err(RegistryError::NotEmpty(path.to_string()));
        }
        self.remove_node(path);
        Ok(())
    }

    fn get(&self, session_id: i64, path: &str) -> Result<Vec<u8>> {
        self.check_session(session_id)?;
        self.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))
    }

    fn exists(&self, session_id: i64, path: &str) -> Result<bool> {
        self.check_session(session_id)?;
        Ok(self.nodes.contains_key(path))
    }

    fn children_w(&mut self, session_id: i64, path: &str) -> Result<(Vec<String>, ChildrenWatch)> {
        self.check_session(session_id)?;
        if !self.nodes.contains_key(path) {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        let children = self.children_of(path);
        let (tx, rx) = oneshot::channel();
        self.watchers
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session_id, tx });
        Ok((children, rx))
    }

    /// 结束会话：删除其临时节点、丢弃其 watch
    ///
    /// `expired` 为 true 时保留会话条目并投递 `Expired`，后续操作返回 `SessionExpired`；
    /// 否则移除条目，会话事件流随之结束
    fn end_session(&mut self, session_id: i64, expired: bool) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return false;
        };
        if session.expired && expired {
            return false;
        }

        // 先丢弃该会话的 watch，结束的会话不再收到任何通知
        for watchers in self.watchers.values_mut() {
            watchers.retain(|watcher| watcher.session_id != session_id);
        }
        self.watchers.retain(|_, watchers| !watchers.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.remove_node(&path);
        }

        if expired {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.expired = true;
                let _ = session.events.send(SessionEvent::Expired);
            }
        } else {
            self.sessions.remove(&session_id);
        }
        true
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 设置存储是否可达；不可达时新的连接请求失败
    ///
    /// 状态切换时向所有存活会话投递 `Disconnected` 或 `Connected`，会话本身保持有效
    pub fn set_reachable(&self, reachable: bool) {
        let mut tree = self.lock();
        if tree.reachable == reachable {
            return;
        }
        tree.reachable = reachable;

        let event = if reachable {
            SessionEvent::Connected
        } else {
            SessionEvent::Disconnected
        };
        for session in tree.sessions.values().filter(|session| !session.expired) {
            let _ = session.events.send(event);
        }
        debug!(reachable, sessions = tree.sessions.len(), "memory store reachability changed");
    }

    /// 让指定会话过期
    ///
    /// 返回 false 表示会话不存在或已过期
    pub fn expire_session(&self, session_id: i64) -> bool {
        let expired = self.lock().end_session(session_id, true);
        if expired {
            debug!(session_id, "memory store session expired");
        }
        expired
    }

    /// 所有存活（未关闭、未过期）会话的 ID
    pub fn session_ids(&self) -> Vec<i64> {
        let tree = self.lock();
        let mut ids: Vec<i64> = tree
            .sessions
            .iter()
            .filter(|(_, session)| !session.expired)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// 直接读取子节点名（不挂载 watch）
    pub fn children(&self, path: &str) -> Vec<String> {
        let mut children = self.lock().children_of(path);
        children.sort();
        children
    }

    /// 直接读取节点数据
    pub fn data(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(path).map(|node| node.data.clone())
    }
}

#[async_trait]
impl Connector for MemoryStore {
    async fn connect(
        &self,
        _addresses: &[String],
        _session_timeout: Duration,
    ) -> Result<(Arc<dyn Connection>, SessionEvents)> {
        let mut tree = self.lock();
        if !tree.reachable {
            return Err(RegistryError::ConnectionFailed(
                "memory store is unreachable".to_string(),
            ));
        }

        let session_id = tree.next_session_id;
        tree.next_session_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Connected);
        tree.sessions.insert(
            session_id,
            Session {
                events: tx,
                expired: false,
            },
        );
        drop(tree);

        debug!(session_id, "memory store session established");
        let connection = MemoryConnection {
            store: self.clone(),
            session_id,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(connection), rx))
    }
}

/// 内存存储上的一个会话
pub struct MemoryConnection {
    store: MemoryStore,
    session_id: i64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn close_session(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.store.lock().end_session(self.session_id, false);
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn session_id(&self) -> i64 {
        self.session_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.store.lock().create(self.session_id, path, data, mode)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.store.lock().delete(self.session_id, path)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.store.lock().get(self.session_id, path)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.store.lock().exists(self.session_id, path)
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ChildrenWatch)> {
        self.store.lock().children_w(self.session_id, path)
    }

    async fn close(&self) {
        self.close_session();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close_session();
    }
}
