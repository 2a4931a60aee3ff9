//! 目录观察者
//!
//! Watch 持有一个协调存储连接，在后台循环中维护目录下成员键的有序快照：
//! 子节点 watch 触发后重新挂载并整表替换；会话过期后关闭旧连接，
//! 下一轮重连、补建目录并重新计算。每次替换后发出一次合并的变更通知。

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerSet;
use crate::error::{FatalSource, RegistryError, Result};
use crate::store::{ChildrenWatch, Connection, SessionEvent, SessionEvents, join_path};

/// 变更通知接收端
///
/// 值为累计事件数；通知是合并的，收到后应重新读取 [`Watch::endpoints`]
pub type EventReceiver = watch::Receiver<u64>;

/// 循环持有的连接状态
struct Attached {
    conn: Arc<dyn Connection>,
    session: SessionEvents,
    children: ChildrenWatch,
}

enum Wake {
    Shutdown,
    Session(Option<SessionEvent>),
    Children,
}

struct WatchInner {
    server_set: ServerSet,
    path: String,
    endpoints: RwLock<Vec<String>>,
    events: Mutex<Option<watch::Sender<u64>>>,
    event_count: AtomicU64,
    last_event: Mutex<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// 目录的实时成员视图
pub struct Watch {
    inner: Arc<WatchInner>,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("path", &self.inner.path)
            .field("event_count", &self.event_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Watch {
    pub(crate) async fn open(server_set: ServerSet) -> Result<Self> {
        let path = server_set.directory_path();
        let (conn, session) = server_set.connect().await?;
        let (events, _) = watch::channel(0);

        let inner = Arc::new(WatchInner {
            server_set,
            path,
            endpoints: RwLock::new(Vec::new()),
            events: Mutex::new(Some(events)),
            event_count: AtomicU64::new(0),
            last_event: Mutex::new(None),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let children = match inner.bootstrap(conn.as_ref()).await {
            Ok(children) => children,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        info!(
            path = %inner.path,
            endpoints = inner.read_endpoints().len(),
            "watch established"
        );

        let attached = Attached {
            conn,
            session,
            children,
        };
        let task = tokio::spawn(run(inner.clone(), attached));
        *inner.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(Self { inner })
    }

    /// 当前成员键快照（有序）
    pub fn endpoints(&self) -> Vec<String> {
        self.inner.read_endpoints()
    }

    /// 新的变更通知接收端；关闭后返回的接收端处于已关闭状态
    pub fn event(&self) -> EventReceiver {
        match self
            .inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(tx) => tx.subscribe(),
            None => watch::channel(self.event_count()).1,
        }
    }

    /// 关闭观察者：停止循环、关闭连接、关闭通知通道
    ///
    /// 幂等
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.inner
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!(path = %self.inner.path, "watch closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 已发出的变更通知数（不含初始快照）
    pub fn event_count(&self) -> u64 {
        self.inner.event_count.load(Ordering::Acquire)
    }

    /// 最近一次变更的时间
    pub fn last_event(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_event
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn directory_path(&self) -> &str {
        &self.inner.path
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl WatchInner {
    fn read_endpoints(&self) -> Vec<String> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn fatal_source(&self) -> FatalSource {
        FatalSource::Watch {
            path: self.path.clone(),
        }
    }

    async fn bootstrap(&self, conn: &dyn Connection) -> Result<ChildrenWatch> {
        self.server_set.create_full_path(conn).await?;
        self.refresh(conn).await
    }

    /// 重新挂载子节点 watch 并整表替换快照
    ///
    /// 列出后、读取前消失的子节点直接跳过
    async fn refresh(&self, conn: &dyn Connection) -> Result<ChildrenWatch> {
        let (children, watch) = conn.children_w(&self.path).await?;

        let mut endpoints = Vec::with_capacity(children.len());
        for child in children {
            match conn.get(&join_path(&self.path, &child)).await {
                Ok(_) => endpoints.push(child),
                Err(RegistryError::NoNode(_)) => {
                    debug!(path = %self.path, child = %child, "member vanished before read");
                }
                Err(e) => return Err(e),
            }
        }
        endpoints.sort();

        *self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner) = endpoints;
        Ok(watch)
    }

    fn emit(&self) {
        let count = self.event_count.fetch_add(1, Ordering::AcqRel) + 1;
        *self.last_event.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if let Some(tx) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            tx.send_replace(count);
        }
    }

    async fn reattach(&self) -> Result<Attached> {
        let (conn, session) = self.server_set.connect().await?;
        match self.bootstrap(conn.as_ref()).await {
            Ok(children) => {
                info!(
                    path = %self.path,
                    session_id = conn.session_id(),
                    "watch re-established after session loss"
                );
                Ok(Attached {
                    conn,
                    session,
                    children,
                })
            }
            Err(e) => {
                conn.close().await;
                Err(e)
            }
        }
    }
}

async fn run(inner: Arc<WatchInner>, attached: Attached) {
    let mut state = Some(attached);

    loop {
        let mut attached = match state.take() {
            Some(attached) => attached,
            None => {
                if inner.shutdown.is_cancelled() {
                    return;
                }
                match inner.reattach().await {
                    Ok(attached) => {
                        inner.emit();
                        attached
                    }
                    Err(e) => {
                        inner.server_set.report_fatal(inner.fatal_source(), e);
                        return;
                    }
                }
            }
        };

        let wake = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => Wake::Shutdown,
            event = attached.session.recv() => Wake::Session(event),
            _ = &mut attached.children => Wake::Children,
        };

        match wake {
            Wake::Shutdown => {
                attached.conn.close().await;
                return;
            }
            Wake::Session(Some(SessionEvent::Expired)) | Wake::Session(None) => {
                warn!(path = %inner.path, "watch session lost, reconnecting");
                attached.conn.close().await;
            }
            Wake::Session(Some(event)) => {
                debug!(path = %inner.path, ?event, "watch session event");
                state = Some(attached);
            }
            Wake::Children => match inner.refresh(attached.conn.as_ref()).await {
                Ok(children) => {
                    inner.emit();
                    debug!(
                        path = %inner.path,
                        endpoints = inner.read_endpoints().len(),
                        "watch snapshot replaced"
                    );
                    attached.children = children;
                    state = Some(attached);
                }
                Err(e) if e.is_session_lost() => {
                    warn!(path = %inner.path, error = %e, "watch session lost during refresh");
                    attached.conn.close().await;
                }
                Err(e) => {
                    inner.server_set.report_fatal(inner.fatal_source(), e);
                    attached.conn.close().await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn server_set(store: &MemoryStore) -> ServerSet {
        ServerSet::new(Environment::Test, "watch-test", vec![], Arc::new(store.clone())).unwrap()
    }

    async fn wait_for_len(watch: &Watch, len: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            let mut rx = watch.event();
            while watch.endpoints().len() != len {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("watch did not converge");
    }

    /// 测试：初始快照不产生事件
    #[tokio::test]
    async fn test_initial_snapshot() {
        let store = MemoryStore::new();
        let set = server_set(&store);
        let first = set.register_endpoint("127.0.0.1", 1, None).await.unwrap();
        let second = set.register_endpoint("127.0.0.1", 2, None).await.unwrap();

        let watch = set.watch().await.unwrap();
        assert_eq!(watch.endpoints().len(), 2);
        assert_eq!(watch.event_count(), 0);
        assert!(watch.last_event().is_none());
        assert_eq!(watch.directory_path(), "/registry/watch-test/providers");

        let mut sorted = watch.endpoints();
        sorted.sort();
        assert_eq!(watch.endpoints(), sorted);

        first.close().await;
        second.close().await;
        watch.close().await;
    }

    /// 测试：成员变化触发事件
    #[tokio::test]
    async fn test_change_emits_event() {
        let store = MemoryStore::new();
        let set = server_set(&store);
        let watch = set.watch().await.unwrap();
        let mut rx = watch.event();
        assert!(watch.endpoints().is_empty());

        let endpoint = set.register_endpoint("10.1.1.1", 8080, None).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(watch.endpoints().len(), 1);
        assert!(watch.event_count() >= 1);
        assert!(watch.last_event().is_some());

        endpoint.close().await;
        wait_for_len(&watch, 0).await;
        watch.close().await;
    }

    /// 测试：关闭后通知通道关闭
    #[tokio::test]
    async fn test_close_is_idempotent() {
        let store = MemoryStore::new();
        let set = server_set(&store);
        let watch = set.watch().await.unwrap();
        let mut rx = watch.event();

        watch.close().await;
        watch.close().await;
        assert!(watch.is_closed());
        assert!(rx.changed().await.is_err());
        assert!(watch.event().changed().await.is_err());
        assert!(store.session_ids().is_empty());
    }

    /// 测试：会话过期后观察者自动恢复
    #[tokio::test]
    async fn test_recover_after_expiry() {
        let store = MemoryStore::new();
        let set = server_set(&store);
        let watch = set.watch().await.unwrap();
        let sessions = store.session_ids();
        assert_eq!(sessions.len(), 1);

        let mut rx = watch.event();
        assert!(store.expire_session(sessions[0]));
        rx.changed().await.unwrap();
        assert_eq!(store.session_ids().len(), 1);
        assert_ne!(store.session_ids(), sessions);

        let endpoint = set.register_endpoint("10.2.2.2", 80, None).await.unwrap();
        wait_for_len(&watch, 1).await;

        endpoint.close().await;
        watch.close().await;
    }
}
