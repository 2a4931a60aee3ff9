//! 注册端点
//!
//! 一个 Endpoint 对应一个服务实例在目录下的临时节点，内部维护两个后台任务：
//! - 会话任务：会话过期（或事件流结束）后重连、补建目录，存活时重建节点
//! - 探测任务（仅在提供探测函数时）：按间隔探测，存活状态翻转时创建或删除节点
//!
//! 不变量：未关闭时，每次协调完成后 `alive == node_key.is_some()`

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerSet;
use super::member::{Member, NodePayload};
use crate::error::{FatalSource, RegistryError, Result};
use crate::store::{Connection, SessionEvent, SessionEvents, join_path};

/// 存活探测
///
/// 返回 `Ok(())` 表示实例存活
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn ping(&self) -> anyhow::Result<()> {
        (self)().await
    }
}

/// 端点状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// 认为存活，但节点尚未（重新）建立
    Unregistered,
    /// 存活且节点存在
    Alive,
    /// 探测失败，节点已删除
    Dead,
    /// 已关闭
    Closed,
}

struct Registration {
    conn: Option<Arc<dyn Connection>>,
    node_key: Option<String>,
    alive: bool,
}

struct EndpointInner {
    server_set: ServerSet,
    host: String,
    port: u16,
    member_path: String,
    payload: Vec<u8>,
    registration: Mutex<Registration>,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// 已注册的服务实例
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("member_path", &self.inner.member_path)
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Endpoint {
    pub(crate) async fn register(
        server_set: ServerSet,
        host: String,
        port: u16,
        member: Member,
        payload: NodePayload,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Self> {
        let alive = match &probe {
            Some(probe) => match probe.ping().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(host = %host, port, error = %e, "initial probe failed, registering as dead");
                    false
                }
            },
            None => true,
        };

        let member_path = join_path(&server_set.directory_path(), &member.encode());
        let payload = payload.to_bytes()?;

        let (conn, events) = server_set.connect().await?;
        let node_key = match initial_node(&server_set, conn.as_ref(), &member_path, &payload, alive).await {
            Ok(node_key) => node_key,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };

        info!(
            service = %server_set.service(),
            host = %host,
            port,
            alive,
            node = node_key.as_deref().unwrap_or("-"),
            "endpoint registered"
        );

        let inner = Arc::new(EndpointInner {
            server_set,
            host,
            port,
            member_path,
            payload,
            registration: Mutex::new(Registration {
                conn: Some(conn),
                node_key,
                alive,
            }),
            shutdown: CancellationToken::new(),
            tasks: StdMutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        let mut tasks = vec![tokio::spawn(session_loop(inner.clone(), events))];
        if let Some(probe) = probe {
            tasks.push(tokio::spawn(ping_loop(inner.clone(), probe)));
        }
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        Ok(Self { inner })
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// 成员节点的基础路径（不含顺序后缀）
    pub fn member_path(&self) -> &str {
        &self.inner.member_path
    }

    pub async fn state(&self) -> EndpointState {
        if self.inner.closed.load(Ordering::Acquire) {
            return EndpointState::Closed;
        }
        let registration = self.inner.registration.lock().await;
        match (registration.alive, registration.node_key.is_some()) {
            (_, true) => EndpointState::Alive,
            (false, false) => EndpointState::Dead,
            (true, false) => EndpointState::Unregistered,
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.state().await == EndpointState::Alive
    }

    /// 当前节点路径（含顺序后缀），未注册时为 None
    pub async fn node_key(&self) -> Option<String> {
        self.inner.registration.lock().await.node_key.clone()
    }

    /// 当前连接的会话 ID
    pub async fn session_id(&self) -> Option<i64> {
        self.inner
            .registration
            .lock()
            .await
            .conn
            .as_ref()
            .map(|conn| conn.session_id())
    }

    /// 关闭端点：停止后台任务、删除节点、关闭连接
    ///
    /// 幂等，重复调用直接返回
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown.cancel();

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            let _ = task.await;
        }

        let mut registration = self.inner.registration.lock().await;
        registration.alive = false;
        if let Some(conn) = registration.conn.take() {
            if let Some(node_key) = registration.node_key.take() {
                match conn.delete(&node_key).await {
                    Ok(()) | Err(RegistryError::NoNode(_)) => {}
                    Err(e) if e.is_session_lost() => {}
                    Err(e) => warn!(node = %node_key, error = %e, "Failed to delete endpoint node"),
                }
            }
            conn.close().await;
        }
        registration.node_key = None;

        info!(host = %self.inner.host, port = self.inner.port, "endpoint closed");
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        // 未显式关闭时停止后台任务，连接随最后一个任务退出而释放
        self.inner.shutdown.cancel();
    }
}

async fn initial_node(
    server_set: &ServerSet,
    conn: &dyn Connection,
    member_path: &str,
    payload: &[u8],
    alive: bool,
) -> Result<Option<String>> {
    server_set.create_full_path(conn).await?;
    if !alive {
        return Ok(None);
    }
    let node_key = conn
        .create(member_path, payload, server_set.create_mode())
        .await?;
    Ok(Some(node_key))
}

impl EndpointInner {
    fn fatal_source(&self) -> FatalSource {
        FatalSource::Endpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// 换用新会话；存活时重建节点（不重新探测）
    async fn reconnect(&self) -> Result<SessionEvents> {
        let mut registration = self.registration.lock().await;
        if let Some(stale) = registration.conn.take() {
            stale.close().await;
        }
        registration.node_key = None;

        let (conn, events) = self.server_set.connect().await?;
        let node_key = initial_node(
            &self.server_set,
            conn.as_ref(),
            &self.member_path,
            &self.payload,
            registration.alive,
        )
        .await?;

        info!(
            host = %self.host,
            port = self.port,
            session_id = conn.session_id(),
            alive = registration.alive,
            "endpoint re-registered after session loss"
        );
        registration.node_key = node_key;
        registration.conn = Some(conn);
        Ok(events)
    }

    /// 应用探测结果；状态未变化时不做任何写入
    async fn set_alive(&self, alive: bool) -> Result<()> {
        let mut registration = self.registration.lock().await;
        if registration.alive == alive {
            return Ok(());
        }
        let conn = registration
            .conn
            .clone()
            .ok_or(RegistryError::ConnectionClosed)?;

        let result = if alive {
            conn.create(&self.member_path, &self.payload, self.server_set.create_mode())
                .await
                .map(Some)
        } else {
            match registration.node_key.as_deref() {
                Some(node_key) => match conn.delete(node_key).await {
                    Ok(()) | Err(RegistryError::NoNode(_)) => Ok(None),
                    Err(e) => Err(e),
                },
                None => Ok(None),
            }
        };

        match result {
            Ok(node_key) => {
                info!(host = %self.host, port = self.port, alive, "endpoint liveness changed");
                registration.node_key = node_key;
                registration.alive = alive;
                Ok(())
            }
            // 会话已失效：临时节点已不存在，由会话任务按最新存活状态重建
            Err(e) if e.is_session_lost() => {
                debug!(host = %self.host, port = self.port, alive, "liveness changed while session lost");
                registration.node_key = None;
                registration.alive = alive;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

async fn session_loop(inner: Arc<EndpointInner>, mut events: SessionEvents) {
    loop {
        let event = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            event = events.recv() => event,
        };

        match event {
            Some(SessionEvent::Expired) | None => {
                warn!(host = %inner.host, port = inner.port, "endpoint session lost, reconnecting");
                match inner.reconnect().await {
                    Ok(fresh) => events = fresh,
                    Err(e) => {
                        inner.server_set.report_fatal(inner.fatal_source(), e);
                        return;
                    }
                }
            }
            Some(event) => debug!(host = %inner.host, port = inner.port, ?event, "endpoint session event"),
        }
    }
}

async fn ping_loop(inner: Arc<EndpointInner>, probe: Arc<dyn HealthProbe>) {
    let mut ticker = interval(inner.server_set.ping_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // 首次探测已在注册时完成
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let alive = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return,
            result = probe.ping() => result.is_ok(),
        };

        if let Err(e) = inner.set_alive(alive).await {
            inner.server_set.report_fatal(inner.fatal_source(), e);
            return;
        }
    }
}
