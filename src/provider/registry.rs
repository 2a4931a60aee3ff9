//! 服务提供者集合
//!
//! 调用方持有的提供者注册表：同一 (策略, 集群, 目录, 分组, 版本) 只创建一个提供者，
//! `close()` 关闭全部提供者，之后拒绝创建新的提供者。
//! 集群由 ServerSet 的环境与协调存储地址列表确定，不同集群上同名目录互不复用。

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{RoundRobinProvider, ServiceProvider, SmoothWeightedProvider};
use crate::config::{Environment, LoadBalanceStrategy, ServiceConfig};
use crate::error::{RegistryError, Result};
use crate::serverset::ServerSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProviderKey {
    strategy: LoadBalanceStrategy,
    environment: Environment,
    addresses: Vec<String>,
    directory: String,
    config: ServiceConfig,
}

impl ProviderKey {
    fn new(server_set: &ServerSet, strategy: LoadBalanceStrategy, config: ServiceConfig) -> Self {
        // 地址顺序不影响集群身份
        let mut addresses = server_set.addresses().to_vec();
        addresses.sort();
        addresses.dedup();
        Self {
            strategy,
            environment: server_set.environment(),
            addresses,
            directory: server_set.directory_path(),
            config,
        }
    }
}

/// 服务提供者注册表
#[derive(Default)]
pub struct ProviderRegistry {
    providers: Mutex<HashMap<ProviderKey, Arc<dyn ServiceProvider>>>,
    closed: AtomicBool,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取或创建提供者
    pub async fn provider(
        &self,
        server_set: &ServerSet,
        strategy: LoadBalanceStrategy,
        config: ServiceConfig,
    ) -> Result<Arc<dyn ServiceProvider>> {
        let mut providers = self.providers.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(RegistryError::Closed("provider registry"));
        }

        let key = ProviderKey::new(server_set, strategy, config);
        if let Some(provider) = providers.get(&key) {
            debug!(directory = %key.directory, ?strategy, "reusing provider");
            return Ok(provider.clone());
        }

        let provider: Arc<dyn ServiceProvider> = match strategy {
            LoadBalanceStrategy::RoundRobin => {
                Arc::new(RoundRobinProvider::new(server_set, key.config.clone()).await?)
            }
            LoadBalanceStrategy::SmoothWeightedRoundRobin => {
                Arc::new(SmoothWeightedProvider::new(server_set, key.config.clone()).await?)
            }
        };
        info!(
            directory = %key.directory,
            addresses = ?key.addresses,
            ?strategy,
            group = %key.config.group,
            version = %key.config.version,
            "provider created"
        );
        providers.insert(key, provider.clone());
        Ok(provider)
    }

    pub async fn len(&self) -> usize {
        self.providers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.providers.lock().await.is_empty()
    }

    /// 关闭所有提供者（幂等）
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut providers = self.providers.lock().await;
            self.closed.store(true, Ordering::Release);
            providers.drain().map(|(_, provider)| provider).collect()
        };
        if drained.is_empty() {
            return;
        }

        let count = drained.len();
        join_all(drained.iter().map(|provider| provider.close())).await;
        info!(count, "provider registry closed");
    }
}
