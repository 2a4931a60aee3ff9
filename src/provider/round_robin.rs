//! 轮询提供者

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

use super::{Address, ServiceProvider, Subscription};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::serverset::ServerSet;

/// 轮询提供者
///
/// 快照按 `addr` 排序，计数器对当前长度取模
pub struct RoundRobinProvider {
    config: ServiceConfig,
    addresses: Arc<ArcSwap<Vec<Address>>>,
    counter: AtomicUsize,
    subscription: Subscription,
}

impl RoundRobinProvider {
    pub async fn new(server_set: &ServerSet, config: ServiceConfig) -> Result<Self> {
        let addresses = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let target = addresses.clone();
        let subscription = Subscription::start(server_set, config.clone(), move |mut list| {
            list.sort_by(|a, b| a.addr.cmp(&b.addr));
            target.store(Arc::new(list));
        })
        .await?;

        Ok(Self {
            config,
            addresses,
            counter: AtomicUsize::new(0),
            subscription,
        })
    }

    pub fn directory_path(&self) -> &str {
        self.subscription.directory_path()
    }
}

#[async_trait]
impl ServiceProvider for RoundRobinProvider {
    fn select_server(&self) -> String {
        let addresses = self.addresses.load();
        if addresses.is_empty() {
            warn!(
                path = %self.directory_path(),
                group = %self.config.group,
                version = %self.config.version,
                "No available server"
            );
            return String::new();
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed);
        addresses[index % addresses.len()].url()
    }

    fn addresses(&self) -> Vec<Address> {
        self.addresses.load().iter().cloned().collect()
    }

    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn close(&self) {
        self.subscription.close().await;
    }
}
