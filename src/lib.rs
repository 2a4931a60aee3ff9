//! Flare ServerSet
//!
//! 基于临时节点的服务注册、子节点 watch 服务发现与客户端负载均衡。
//!
//! - [`store`]：协调存储抽象（内存实现，以及 `etcd` feature 下的 etcd 实现）
//! - [`serverset`]：ServerSet / Endpoint / Watch 注册与发现引擎
//! - [`provider`]：轮询与平滑加权轮询服务提供者
//!
//! ```no_run
//! use std::sync::Arc;
//! use flare_serverset::{Environment, ServerSet, ServiceConfig, MemoryStore};
//! use flare_serverset::provider::{RoundRobinProvider, ServiceProvider};
//!
//! # async fn demo() -> flare_serverset::Result<()> {
//! let store = MemoryStore::new();
//! let set = ServerSet::new(Environment::Local, "user-service", vec![], Arc::new(store))?;
//! let endpoint = set.register_endpoint("127.0.0.1", 8080, None).await?;
//!
//! let provider = RoundRobinProvider::new(&set, ServiceConfig::default()).await?;
//! let server = provider.select_server();
//! # let _ = server;
//! provider.close().await;
//! endpoint.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod provider;
pub mod serverset;
pub mod store;

pub use config::{Config, Environment, LoadBalanceStrategy, RegistryConfig, ServiceConfig};
pub use error::{ErrorCategory, ErrorCode, FatalError, FatalSource, RegistryError, Result};
pub use provider::{
    Address, ProviderRegistry, RoundRobinProvider, ServiceProvider, SmoothWeightedProvider,
};
pub use serverset::{Endpoint, EndpointState, HealthProbe, Member, ServerSet, Watch};
pub use store::MemoryStore;

#[cfg(feature = "etcd")]
pub use store::EtcdConnector;
