//! etcd 协调存储后端
//!
//! 把 ZooKeeper 风格的契约映射到 etcd v3：
//! - 会话 = lease + keep-alive；续约暂时失败投递 `Disconnected`，
//!   连续失败超过 TTL 或服务端报告 TTL 归零才视为会话过期
//! - 临时节点 = 绑定 lease 的 key
//! - 顺序节点 = key 后追加全局 revision 作为序号
//! - 子节点 watch = 前缀 watch，收到第一个直接子节点事件后触发并取消

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, GetOptions, LeaseKeepAliveStream, LeaseKeeper,
    PutOptions, Txn, TxnOp, WatchOptions,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ChildrenWatch, Connection, Connector, CreateMode, SessionEvent, SessionEvents, WatchEvent,
    parent_path, sequential_path, validate_path,
};
use crate::error::{RegistryError, Result};

/// 顺序号计数 key 的前缀
const SEQUENCE_PREFIX: &str = "/__sequence";

fn store_err(err: etcd_client::Error) -> RegistryError {
    match &err {
        // 绑定的 lease 已被回收：会话已经失效
        etcd_client::Error::GRpcStatus(status) if is_lease_gone(status.message()) => {
            RegistryError::SessionExpired
        }
        _ => RegistryError::Store(err.to_string()),
    }
}

fn is_lease_gone(message: &str) -> bool {
    message.contains("requested lease not found") || message.contains("lease expired")
}

/// etcd 连接器
#[derive(Debug, Clone, Default)]
pub struct EtcdConnector {
    connect_timeout: Option<Duration>,
}

impl EtcdConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置建立连接的超时
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(
        &self,
        addresses: &[String],
        session_timeout: Duration,
    ) -> Result<(Arc<dyn Connection>, SessionEvents)> {
        let ttl = session_timeout.as_secs().max(1) as i64;
        let deadline = self.connect_timeout.unwrap_or(session_timeout);
        let (client, lease_id) = tokio::time::timeout(deadline, establish(addresses, deadline, ttl))
            .await
            .map_err(|_| {
                warn!(?addresses, timeout = ?deadline, "etcd connect timed out");
                RegistryError::ConnectionTimeout(deadline)
            })??;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SessionEvent::Connected);

        let shutdown = CancellationToken::new();
        tokio::spawn(keep_alive(
            client.clone(),
            lease_id,
            Duration::from_secs(ttl as u64),
            tx,
            shutdown.clone(),
        ));

        info!(lease_id, ttl, "etcd session established");
        let connection = EtcdConnection {
            client,
            lease_id,
            shutdown,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(connection), rx))
    }
}

/// 连接并申请 lease
async fn establish(addresses: &[String], timeout: Duration, ttl: i64) -> Result<(Client, i64)> {
    let options = ConnectOptions::new().with_connect_timeout(timeout);
    let mut client = Client::connect(addresses, Some(options))
        .await
        .map_err(|e| RegistryError::ConnectionFailed(e.to_string()))?;
    let lease = client
        .lease_grant(ttl, None)
        .await
        .map_err(|e| RegistryError::ConnectionFailed(format!("Failed to grant lease: {}", e)))?;
    Ok((client, lease.id()))
}

type KeepAlivePair = (LeaseKeeper, LeaseKeepAliveStream);

/// 续约一次，返回服务端报告的剩余 TTL；`None` 表示续约流已结束
async fn renew(
    client: &mut Client,
    lease_id: i64,
    slot: &mut Option<KeepAlivePair>,
) -> std::result::Result<Option<i64>, etcd_client::Error> {
    let pair = match slot.take() {
        Some(pair) => pair,
        None => client.lease_keep_alive(lease_id).await?,
    };
    let (keeper, stream) = slot.insert(pair);
    keeper.keep_alive().await?;
    Ok(stream.message().await?.map(|resp| resp.ttl()))
}

/// 维持 lease
///
/// 续约失败时投递一次 `Disconnected` 并在下个周期重建续约流，恢复后投递 `Connected`；
/// 自上次成功续约起超过 TTL，或服务端报告 TTL 归零时投递 `Expired` 并退出
async fn keep_alive(
    mut client: Client,
    lease_id: i64,
    ttl: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(100)));
    let mut slot: Option<KeepAlivePair> = None;
    let mut last_renewed = Instant::now();
    let mut connected = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if last_renewed.elapsed() >= ttl {
            error!(lease_id, ?ttl, "Lease not renewed within TTL");
            let _ = events.send(SessionEvent::Expired);
            return;
        }

        let failure = match renew(&mut client, lease_id, &mut slot).await {
            Ok(Some(remaining)) if remaining > 0 => {
                debug!(lease_id, ttl = remaining, "Lease keep-alive successful");
                last_renewed = Instant::now();
                if !connected {
                    connected = true;
                    info!(lease_id, "Lease keep-alive recovered");
                    let _ = events.send(SessionEvent::Connected);
                }
                continue;
            }
            Ok(Some(_)) => {
                warn!(lease_id, "Lease expired on server");
                let _ = events.send(SessionEvent::Expired);
                return;
            }
            Ok(None) => "keep-alive stream ended".to_string(),
            Err(e) => e.to_string(),
        };

        slot = None;
        if connected {
            connected = false;
            warn!(lease_id, error = %failure, "Lease keep-alive failed, retrying");
            let _ = events.send(SessionEvent::Disconnected);
        } else {
            debug!(lease_id, error = %failure, "Lease keep-alive still failing");
        }
    }
}

/// 一个 etcd 会话
pub struct EtcdConnection {
    client: Client,
    lease_id: i64,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl EtcdConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(RegistryError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn children_prefix(path: &str) -> String {
        if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        }
    }

    /// 取得下一个全局序号（计数 key 写入后的 revision）
    async fn next_sequence(&self, parent: &str) -> Result<u64> {
        let mut client = self.client.clone();
        let resp = client
            .put(format!("{}{}", SEQUENCE_PREFIX, parent), "", None)
            .await
            .map_err(store_err)?;
        resp.header()
            .map(|header| header.revision() as u64)
            .ok_or_else(|| RegistryError::Store("put response without header".to_string()))
    }
}

#[async_trait]
impl Connection for EtcdConnection {
    fn session_id(&self) -> i64 {
        self.lease_id
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        self.check_open()?;
        validate_path(path)?;
        let parent = parent_path(path).ok_or_else(|| RegistryError::NodeExists(path.to_string()))?;
        if parent != "/" && !self.exists(parent).await? {
            return Err(RegistryError::NoNode(parent.to_string()));
        }

        let actual = if mode.is_sequential() {
            sequential_path(path, self.next_sequence(parent).await?)
        } else {
            path.to_string()
        };

        let options = if mode.is_ephemeral() {
            Some(PutOptions::new().with_lease(self.lease_id))
        } else {
            None
        };
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                actual.as_str(),
                CompareOp::Equal,
                0,
            )])
            .and_then(vec![TxnOp::put(actual.as_str(), data.to_vec(), options)]);

        let mut client = self.client.clone();
        let resp = client.txn(txn).await.map_err(store_err)?;
        if resp.succeeded() {
            Ok(actual)
        } else {
            Err(RegistryError::NodeExists(actual))
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.check_open()?;
        let mut client = self.client.clone();
        let children = client
            .get(
                Self::children_prefix(path),
                Some(GetOptions::new().with_prefix().with_keys_only().with_limit(1)),
            )
            .await
            .map_err(store_err)?;
        if !children.kvs().is_empty() {
            return Err(RegistryError::NotEmpty(path.to_string()));
        }

        let resp = client.delete(path, None).await.map_err(store_err)?;
        if resp.deleted() == 0 {
            return Err(RegistryError::NoNode(path.to_string()));
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut client = self.client.clone();
        let resp = client.get(path, None).await.map_err(store_err)?;
        resp.kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| RegistryError::NoNode(path.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        if path == "/" {
            return Ok(true);
        }
        let mut client = self.client.clone();
        let resp = client
            .get(path, Some(GetOptions::new().with_keys_only()))
            .await
            .map_err(store_err)?;
        Ok(!resp.kvs().is_empty())
    }

    async fn children_w(&self, path: &str) -> Result<(Vec<String>, ChildrenWatch)> {
        self.check_open()?;
        if !self.exists(path).await? {
            return Err(RegistryError::NoNode(path.to_string()));
        }

        let prefix = Self::children_prefix(path);
        let mut client = self.client.clone();
        let resp = client
            .get(
                prefix.as_str(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await
            .map_err(store_err)?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let children: Vec<String> = resp
            .kvs()
            .iter()
            .filter_map(|kv| direct_child(&prefix, kv.key()))
            .collect();

        let (mut watcher, mut stream) = client
            .watch(
                prefix.as_str(),
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_start_revision(revision + 1),
                ),
            )
            .await
            .map_err(store_err)?;

        let (mut tx, rx) = oneshot::channel();
        let shutdown = self.shutdown.clone();
        let watched = path.to_string();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tx.closed() => break,
                    message = stream.message() => message,
                };
                match message {
                    Ok(Some(resp)) => {
                        let changed = resp.events().iter().any(|event| {
                            event
                                .kv()
                                .is_some_and(|kv| direct_child(&prefix, kv.key()).is_some())
                        });
                        if changed {
                            let _ = tx.send(WatchEvent::ChildrenChanged { path: watched });
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(path = %watched, error = %e, "etcd watch stream error");
                        break;
                    }
                }
            }
            let _ = watcher.cancel().await;
        });

        Ok((children, rx))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(self.lease_id).await {
            warn!(lease_id = self.lease_id, error = %e, "Failed to revoke lease");
        }
        info!(lease_id = self.lease_id, "etcd session closed");
    }
}

impl Drop for EtcdConnection {
    fn drop(&mut self) {
        // 未显式关闭时停止 keep-alive，临时节点随 lease TTL 到期删除
        self.shutdown.cancel();
    }
}

fn direct_child(prefix: &str, key: &[u8]) -> Option<String> {
    let key = std::str::from_utf8(key).ok()?;
    let rest = key.strip_prefix(prefix)?;
    (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
}
