//! 服务注册发现统一错误类型

use super::code::ErrorCode;
use thiserror::Error;

/// 服务注册发现统一错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// 服务名非法（为空或包含路径分隔符）
    #[error("invalid service name `{0}`: must be non-empty and must not contain '/'")]
    InvalidServiceName(String),

    /// 路径非法
    #[error("invalid path `{0}`")]
    InvalidPath(String),

    /// 无法连接协调存储
    #[error("failed to connect to coordination store: {0}")]
    ConnectionFailed(String),

    /// 在限定时间内未能建立连接
    #[error("timed out connecting to coordination store after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// 连接已关闭
    #[error("coordination store connection closed")]
    ConnectionClosed,

    /// 会话已过期
    #[error("coordination store session expired")]
    SessionExpired,

    /// 节点不存在
    #[error("node does not exist: {0}")]
    NoNode(String),

    /// 节点已存在
    #[error("node already exists: {0}")]
    NodeExists(String),

    /// 节点仍有子节点
    #[error("node has children: {0}")]
    NotEmpty(String),

    /// 协调存储的其他错误
    #[error("coordination store error: {0}")]
    Store(String),

    /// 成员键无法解析
    #[error("malformed member key `{key}`: {reason}")]
    MalformedMember { key: String, reason: String },

    /// 序列化错误
    #[error("serialization error: {0}")]
    Serialization(String),

    /// 配置错误
    #[error("configuration error: {0}")]
    Config(String),

    /// 资源已关闭
    #[error("{0} is closed")]
    Closed(&'static str),
}

impl RegistryError {
    /// 创建成员键解析错误
    pub fn malformed_member(key: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::MalformedMember {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::InvalidServiceName(_) => ErrorCode::InvalidParameter,
            RegistryError::InvalidPath(_) => ErrorCode::InvalidPath,
            RegistryError::ConnectionFailed(_) => ErrorCode::ConnectionFailed,
            RegistryError::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            RegistryError::ConnectionClosed => ErrorCode::ConnectionClosed,
            RegistryError::SessionExpired => ErrorCode::SessionExpired,
            RegistryError::NoNode(_) => ErrorCode::NodeNotFound,
            RegistryError::NodeExists(_) => ErrorCode::NodeExists,
            RegistryError::NotEmpty(_) => ErrorCode::NodeNotEmpty,
            RegistryError::Store(_) => ErrorCode::InternalError,
            RegistryError::MalformedMember { .. } => ErrorCode::DeserializationError,
            RegistryError::Serialization(_) => ErrorCode::SerializationError,
            RegistryError::Config(_) => ErrorCode::ConfigurationError,
            RegistryError::Closed(_) => ErrorCode::ResourceClosed,
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    /// 判断是否表示会话丢失（需要重新建立连接）
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            RegistryError::SessionExpired | RegistryError::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for RegistryError {
    fn from(err: serde_json::Error) -> Self {
        RegistryError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RegistryError {
    fn from(err: toml::de::Error) -> Self {
        RegistryError::Config(err.to_string())
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        RegistryError::Config(err.to_string())
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, RegistryError>;
