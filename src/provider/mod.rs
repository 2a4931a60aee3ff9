//! 客户端负载均衡
//!
//! 服务提供者订阅一个 [`Watch`]，把成员键解码为 [`Address`]，
//! 按分组和版本过滤后整体替换快照；`select_server()` 只读取最新快照，不做 I/O。
//!
//! - [`RoundRobinProvider`]：按地址排序后轮询
//! - [`SmoothWeightedProvider`]：平滑加权轮询
//! - [`ProviderRegistry`]：按 (策略, 目录, 分组, 版本) 去重的提供者集合

pub mod registry;
pub mod round_robin;
pub mod weighted;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::serverset::{Member, ServerSet, Watch};

pub use registry::ProviderRegistry;
pub use round_robin::RoundRobinProvider;
pub use weighted::SmoothWeightedProvider;

/// 可供选择的服务地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    /// host:port
    pub addr: String,
    pub scheme: String,
    pub root_path: String,
    pub weight: u32,
    /// 平滑加权轮询的累加值
    pub current_weight: i64,
    pub group: String,
    pub version: String,
}

impl Address {
    pub fn from_member(member: &Member) -> Self {
        Self {
            addr: member.address(),
            scheme: member.scheme.clone(),
            root_path: member.root_path.clone(),
            weight: member.weight,
            current_weight: 0,
            group: member.group.clone(),
            version: member.version.clone(),
        }
    }

    /// `scheme://addr` + rootPath
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.addr, self.root_path)
    }
}

/// 服务提供者
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    /// 选择一个服务地址；无可用地址时返回空串
    fn select_server(&self) -> String;

    /// 当前地址快照
    fn addresses(&self) -> Vec<Address>;

    /// 目标分组与版本
    fn config(&self) -> &ServiceConfig;

    /// 停止订阅并关闭内部的 Watch（幂等）
    async fn close(&self);
}

/// 解码成员键并按分组和版本过滤；无法解码的键跳过
pub(crate) fn build_addresses(endpoints: &[String], config: &ServiceConfig) -> Vec<Address> {
    endpoints
        .iter()
        .filter_map(|key| match Member::decode(key) {
            Ok(member) => Some(member),
            Err(e) => {
                warn!(key = %key, error = %e, "Skipping undecodable member key");
                None
            }
        })
        .filter(|member| member.group == config.group && member.version == config.version)
        .map(|member| Address::from_member(&member))
        .collect()
}

/// 提供者对 Watch 的订阅
///
/// 创建时同步构建一次快照，之后每个变更通知触发一次重建
pub(crate) struct Subscription {
    watch: Arc<Watch>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Subscription {
    pub(crate) async fn start<F>(
        server_set: &ServerSet,
        config: ServiceConfig,
        rebuild: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<Address>) + Send + Sync + 'static,
    {
        let watch = Arc::new(server_set.watch().await?);
        // 先订阅再构建，避免漏掉两者之间的变更
        let mut events = watch.event();
        rebuild(build_addresses(&watch.endpoints(), &config));

        let shutdown = CancellationToken::new();
        let task = tokio::spawn({
            let watch = watch.clone();
            let shutdown = shutdown.clone();
            async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return,
                        changed = events.changed() => {
                            if changed.is_err() {
                                debug!(path = %watch.directory_path(), "watch closed, provider stops refreshing");
                                return;
                            }
                        }
                    }
                    let addresses = build_addresses(&watch.endpoints(), &config);
                    debug!(
                        path = %watch.directory_path(),
                        addresses = addresses.len(),
                        "provider addresses rebuilt"
                    );
                    rebuild(addresses);
                }
            }
        });

        info!(path = %watch.directory_path(), "provider subscribed");
        Ok(Self {
            watch,
            shutdown,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn directory_path(&self) -> &str {
        self.watch.directory_path()
    }

    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.watch.close().await;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(host: &str, port: u16, group: &str, version: &str) -> String {
        Member::new(host, port, "svc")
            .with_group(group)
            .with_version(version)
            .encode()
    }

    #[test]
    fn test_build_addresses_filters_group_and_version() {
        let endpoints = vec![
            key("10.0.0.1", 80, "blue", "v1"),
            format!("{}~0000000003", key("10.0.0.2", 80, "blue", "v1")),
            key("10.0.0.3", 80, "green", "v1"),
            key("10.0.0.4", 80, "blue", "v2"),
            "garbage".to_string(),
        ];
        let addresses = build_addresses(&endpoints, &ServiceConfig::new("blue", "v1"));
        let addrs: Vec<&str> = addresses.iter().map(|a| a.addr.as_str()).collect();
        assert_eq!(addrs, vec!["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[test]
    fn test_address_url() {
        let member = Member::new("localhost", 8080, "svc")
            .with_scheme("https")
            .with_root_path("/api");
        assert_eq!(Address::from_member(&member).url(), "https://localhost:8080/api");
        assert_eq!(
            Address::from_member(&Member::new("h", 1, "svc")).url(),
            "http://h:1"
        );
    }
}
