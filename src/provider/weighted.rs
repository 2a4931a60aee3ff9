//! 平滑加权轮询提供者
//!
//! 每次选择时所有地址的 `current_weight` 加上各自权重，选出最大者（并列取第一个），
//! 再从胜者减去总权重。成员变化时快照整体重建，累加值随之归零。

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

use super::{Address, ServiceProvider, Subscription};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::serverset::ServerSet;

/// 一次重建得到的加权集合
struct WeightedSet {
    total_weight: i64,
    entries: Mutex<Vec<Address>>,
}

impl WeightedSet {
    fn new(mut entries: Vec<Address>) -> Self {
        for entry in entries.iter_mut() {
            entry.current_weight = 0;
        }
        Self {
            total_weight: entries.iter().map(|entry| i64::from(entry.weight)).sum(),
            entries: Mutex::new(entries),
        }
    }
}

/// 执行一次平滑加权选择，返回胜者下标
pub(crate) fn smooth_weighted_pick(entries: &mut [Address], total_weight: i64) -> Option<usize> {
    let mut best: Option<(usize, i64)> = None;
    for (index, entry) in entries.iter_mut().enumerate() {
        entry.current_weight += i64::from(entry.weight);
        if best.is_none_or(|(_, weight)| entry.current_weight > weight) {
            best = Some((index, entry.current_weight));
        }
    }
    let (index, _) = best?;
    entries[index].current_weight -= total_weight;
    Some(index)
}

/// 平滑加权轮询提供者
pub struct SmoothWeightedProvider {
    config: ServiceConfig,
    state: Arc<ArcSwap<WeightedSet>>,
    subscription: Subscription,
}

impl SmoothWeightedProvider {
    pub async fn new(server_set: &ServerSet, config: ServiceConfig) -> Result<Self> {
        let state = Arc::new(ArcSwap::from_pointee(WeightedSet::new(Vec::new())));
        let target = state.clone();
        let subscription = Subscription::start(server_set, config.clone(), move |list| {
            target.store(Arc::new(WeightedSet::new(list)));
        })
        .await?;

        Ok(Self {
            config,
            state,
            subscription,
        })
    }

    pub fn directory_path(&self) -> &str {
        self.subscription.directory_path()
    }
}

#[async_trait]
impl ServiceProvider for SmoothWeightedProvider {
    fn select_server(&self) -> String {
        let state = self.state.load();
        let mut entries = state.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match smooth_weighted_pick(&mut entries, state.total_weight) {
            Some(index) => entries[index].url(),
            None => {
                warn!(
                    path = %self.directory_path(),
                    group = %self.config.group,
                    version = %self.config.version,
                    "No available server"
                );
                String::new()
            }
        }
    }

    fn addresses(&self) -> Vec<Address> {
        self.state
            .load()
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn config(&self) -> &ServiceConfig {
        &self.config
    }

    async fn close(&self) {
        self.subscription.close().await;
    }
}
