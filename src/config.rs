//! 服务注册发现配置
//!
//! 支持从 TOML 文件加载，并可通过环境变量覆盖：
//! - `REGISTRY_ENDPOINTS`: 协调存储地址列表（逗号分隔）
//! - `REGISTRY_SESSION_TIMEOUT_MS`: 会话超时（毫秒）
//! - `REGISTRY_DIRECTORY_PATTERN`: 目录路径模板（支持 `{service}` 与 `{environment}`）
//! - `REGISTRY_PING_INTERVAL_MS`: 端点存活探测间隔（毫秒）
//! - `REGISTRY_SEQUENTIAL`: 是否使用顺序临时节点
//! - `REGISTRY_ENVIRONMENT`: 运行环境

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{RegistryError, Result};

/// 默认目录路径模板
pub const DEFAULT_DIRECTORY_PATTERN: &str = "/registry/{service}/providers";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

impl Config {
    /// 从 TOML 文件加载配置，并应用环境变量覆盖
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析配置，并应用环境变量覆盖
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.registry.apply_env()?;
        config.registry.validate()?;
        Ok(config)
    }
}

/// 运行环境
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Test,
    Staging,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Test => "test",
            Environment::Staging => "staging",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "dev" | "development" => Ok(Environment::Local),
            "test" => Ok(Environment::Test),
            "staging" => Ok(Environment::Staging),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

/// 协调存储与注册行为配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 协调存储地址列表
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// 会话超时（毫秒）
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// 目录路径模板
    #[serde(default = "default_directory_pattern")]
    pub directory_pattern: String,

    /// 端点存活探测间隔（毫秒）
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// 是否使用顺序临时节点（同一 host:port 可重复注册）
    #[serde(default = "default_sequential")]
    pub sequential: bool,

    /// 运行环境
    #[serde(default)]
    pub environment: Environment,
}

fn default_endpoints() -> Vec<String> {
    vec!["127.0.0.1:2181".to_string()]
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_directory_pattern() -> String {
    DEFAULT_DIRECTORY_PATTERN.to_string()
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

fn default_sequential() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            session_timeout_ms: default_session_timeout_ms(),
            directory_pattern: default_directory_pattern(),
            ping_interval_ms: default_ping_interval_ms(),
            sequential: default_sequential(),
            environment: Environment::default(),
        }
    }
}

impl RegistryConfig {
    /// 默认配置叠加环境变量
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// 使用环境变量覆盖当前配置
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(endpoints) = std::env::var("REGISTRY_ENDPOINTS") {
            self.endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(ms) = env_parse::<u64>("REGISTRY_SESSION_TIMEOUT_MS")? {
            self.session_timeout_ms = ms;
        }
        if let Ok(pattern) = std::env::var("REGISTRY_DIRECTORY_PATTERN") {
            self.directory_pattern = pattern;
        }
        if let Some(ms) = env_parse::<u64>("REGISTRY_PING_INTERVAL_MS")? {
            self.ping_interval_ms = ms;
        }
        if let Some(sequential) = env_parse::<bool>("REGISTRY_SEQUENTIAL")? {
            self.sequential = sequential;
        }
        if let Ok(env) = std::env::var("REGISTRY_ENVIRONMENT") {
            self.environment = env.parse().map_err(RegistryError::Config)?;
        }
        Ok(())
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(RegistryError::Config(
                "coordination store endpoints must not be empty".to_string(),
            ));
        }
        validate_directory_pattern(&self.directory_pattern)?;
        if self.session_timeout_ms == 0 {
            return Err(RegistryError::Config(
                "session_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.ping_interval_ms == 0 {
            return Err(RegistryError::Config(
                "ping_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// 校验目录路径模板：必须为绝对路径且包含 `{service}`
pub(crate) fn validate_directory_pattern(pattern: &str) -> Result<()> {
    if !pattern.starts_with('/') {
        return Err(RegistryError::Config(format!(
            "directory pattern `{}` must start with '/'",
            pattern
        )));
    }
    if !pattern.contains("{service}") {
        return Err(RegistryError::Config(format!(
            "directory pattern `{}` must contain {{service}}",
            pattern
        )));
    }
    Ok(())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| RegistryError::Config(format!("invalid {}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

/// 服务提供者的目标分组与版本
///
/// 只有分组和版本都完全匹配的端点才对提供者可见
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
}

impl ServiceConfig {
    pub fn new(group: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
        }
    }
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 轮询
    #[default]
    RoundRobin,
    /// 平滑加权轮询
    SmoothWeightedRoundRobin,
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" | "rr" => Ok(LoadBalanceStrategy::RoundRobin),
            "smooth_weighted_round_robin" | "weighted_round_robin" | "swrr" | "wrr" => {
                Ok(LoadBalanceStrategy::SmoothWeightedRoundRobin)
            }
            _ => Err(format!("Unknown load balance strategy: {}", s)),
        }
    }
}
