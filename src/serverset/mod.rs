//! ServerSet：一个逻辑服务的注册目录
//!
//! ServerSet 由 `(environment, service, addresses)` 标识，负责：
//! - 计算服务目录路径（默认 `/registry/{service}/providers`）
//! - 为每个 Endpoint / Watch 建立独立的协调存储连接
//! - 在创建任何成员节点前确保完整目录路径存在
//!
//! 端点通过 [`ServerSet::register_endpoint`] 注册为临时节点，
//! 观察者通过 [`ServerSet::watch`] 获取实时成员列表。

pub mod endpoint;
pub mod member;
pub mod watch;

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::{DEFAULT_DIRECTORY_PATTERN, Environment, RegistryConfig, validate_directory_pattern};
use crate::error::{FatalError, FatalErrorSink, FatalSource, RegistryError, Result};
use crate::store::{Connection, Connector, CreateMode, SessionEvents};

pub use endpoint::{Endpoint, EndpointState, HealthProbe};
pub use member::{Member, NodePayload, ServiceEndpoint};
pub use watch::{EventReceiver, Watch};

/// 默认会话超时
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// 默认端点存活探测间隔
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// 一个逻辑服务的注册目录
///
/// 构造后不可变，克隆开销很小（内部共享）
#[derive(Clone)]
pub struct ServerSet {
    inner: Arc<ServerSetInner>,
}

struct ServerSetInner {
    environment: Environment,
    service: String,
    addresses: Vec<String>,
    session_timeout: Duration,
    directory_pattern: String,
    ping_interval: Duration,
    sequential: bool,
    connector: Arc<dyn Connector>,
    fatal: FatalErrorSink,
}

impl fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSet")
            .field("environment", &self.inner.environment)
            .field("service", &self.inner.service)
            .field("addresses", &self.inner.addresses)
            .field("directory", &self.directory_path())
            .finish()
    }
}

impl ServerSet {
    /// 创建 ServerSet
    ///
    /// 服务名为空或包含 `/` 时返回 `InvalidServiceName`
    pub fn new(
        environment: Environment,
        service: impl Into<String>,
        addresses: Vec<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let service = service.into();
        if service.is_empty() || service.contains('/') {
            return Err(RegistryError::InvalidServiceName(service));
        }

        Ok(Self {
            inner: Arc::new(ServerSetInner {
                environment,
                service,
                addresses,
                session_timeout: DEFAULT_SESSION_TIMEOUT,
                directory_pattern: DEFAULT_DIRECTORY_PATTERN.to_string(),
                ping_interval: DEFAULT_PING_INTERVAL,
                sequential: true,
                connector,
                fatal: FatalErrorSink::new(),
            }),
        })
    }

    /// 从配置创建 ServerSet
    pub fn from_config(
        config: &RegistryConfig,
        service: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let server_set = Self::new(
            config.environment,
            service,
            config.endpoints.clone(),
            connector,
        )?
        .with_directory_pattern(config.directory_pattern.clone())?
        .with_session_timeout(config.session_timeout())
        .with_ping_interval(config.ping_interval())
        .with_sequential(config.sequential);
        Ok(server_set)
    }

    fn map_inner(self, f: impl FnOnce(&mut ServerSetInner)) -> Self {
        let mut inner = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner,
            Err(shared) => ServerSetInner {
                environment: shared.environment,
                service: shared.service.clone(),
                addresses: shared.addresses.clone(),
                session_timeout: shared.session_timeout,
                directory_pattern: shared.directory_pattern.clone(),
                ping_interval: shared.ping_interval,
                sequential: shared.sequential,
                connector: shared.connector.clone(),
                fatal: shared.fatal.clone(),
            },
        };
        f(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 设置会话超时
    pub fn with_session_timeout(self, timeout: Duration) -> Self {
        self.map_inner(|inner| inner.session_timeout = timeout)
    }

    /// 设置目录路径模板（支持 `{service}` 与 `{environment}`）
    pub fn with_directory_pattern(self, pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        validate_directory_pattern(&pattern)?;
        Ok(self.map_inner(|inner| inner.directory_pattern = pattern))
    }

    /// 设置端点存活探测间隔
    pub fn with_ping_interval(self, interval: Duration) -> Self {
        self.map_inner(|inner| inner.ping_interval = interval)
    }

    /// 设置是否使用顺序临时节点
    pub fn with_sequential(self, sequential: bool) -> Self {
        self.map_inner(|inner| inner.sequential = sequential)
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn addresses(&self) -> &[String] {
        &self.inner.addresses
    }

    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    pub fn ping_interval(&self) -> Duration {
        self.inner.ping_interval
    }

    /// 成员节点的创建模式
    pub fn create_mode(&self) -> CreateMode {
        if self.inner.sequential {
            CreateMode::EphemeralSequential
        } else {
            CreateMode::Ephemeral
        }
    }

    /// 服务目录路径，仅由 `(environment, service)` 与模板决定
    pub fn directory_path(&self) -> String {
        base_path(
            &self.inner.directory_pattern,
            self.inner.environment,
            &self.inner.service,
        )
    }

    /// 订阅后台协调任务的致命错误
    pub fn fatal_errors(&self) -> broadcast::Receiver<FatalError> {
        self.inner.fatal.subscribe()
    }

    pub(crate) fn report_fatal(&self, source: FatalSource, err: RegistryError) {
        self.inner.fatal.report(source, err);
    }

    /// 建立一个新的协调存储连接
    pub async fn connect(&self) -> Result<(Arc<dyn Connection>, SessionEvents)> {
        self.inner
            .connector
            .connect(&self.inner.addresses, self.inner.session_timeout)
            .await
    }

    /// 依次创建目录路径上的每一级节点，已存在视为成功
    pub async fn create_full_path(&self, conn: &dyn Connection) -> Result<()> {
        for prefix in ancestor_prefixes(&self.directory_path()) {
            match conn.create(&prefix, &[], CreateMode::Persistent).await {
                Ok(_) => debug!(path = %prefix, "created directory node"),
                Err(RegistryError::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// 注册端点
    ///
    /// 有探测函数时先同步探测一次，探测成功（或无探测函数）才创建节点。
    /// 仅在初始连接或节点创建失败时返回错误。
    pub async fn register_endpoint(
        &self,
        host: impl Into<String>,
        port: u16,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Result<Endpoint> {
        let host = host.into();
        let member = Member::new(host.clone(), port, self.service());
        let payload = NodePayload::new(host.clone(), port);
        Endpoint::register(self.clone(), host, port, member, payload, probe).await
    }

    /// 携带元数据注册端点
    ///
    /// 元数据与计算得到的 `serviceEndpoint`/`status` 合并后作为节点数据；
    /// 其中的 group/version/weight/rootPath/scheme 同时决定成员键
    pub async fn register_endpoint_with_meta(
        &self,
        host: impl Into<String>,
        port: u16,
        probe: Option<Arc<dyn HealthProbe>>,
        meta: Map<String, Value>,
    ) -> Result<Endpoint> {
        let host = host.into();
        let member = Member::from_meta(host.clone(), port, self.service(), &meta);
        let payload = NodePayload::new(host.clone(), port).with_metadata(&meta);
        Endpoint::register(self.clone(), host, port, member, payload, probe).await
    }

    /// 创建目录观察者
    pub async fn watch(&self) -> Result<Watch> {
        Watch::open(self.clone()).await
    }
}

/// 根据模板计算目录路径
pub fn base_path(pattern: &str, environment: Environment, service: &str) -> String {
    pattern
        .replace("{environment}", environment.as_str())
        .replace("{service}", service)
}

/// 路径的所有前缀（由浅到深，包含自身）
fn ancestor_prefixes(path: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current.push('/');
        current.push_str(part);
        prefixes.push(current.clone());
    }
    prefixes
}
