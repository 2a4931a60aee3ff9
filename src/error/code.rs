//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 连接/会话相关错误
/// - 2000-2999: 协调存储节点相关错误
/// - 6000-6999: 系统相关错误
/// - 8000-8999: 序列化相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 连接/会话相关错误 (1000-1999)
    // ============================================================
    ConnectionFailed = 1000,
    ConnectionTimeout = 1001,
    ConnectionClosed = 1002,
    SessionExpired = 1003,

    // ============================================================
    // 节点相关错误 (2000-2999)
    // ============================================================
    NodeNotFound = 2000,
    NodeExists = 2001,
    NodeNotEmpty = 2002,
    InvalidPath = 2003,

    // ============================================================
    // 系统相关错误 (6000-6999)
    // ============================================================
    InternalError = 6000,
    ConfigurationError = 6003,

    // ============================================================
    // 序列化相关错误 (8000-8999)
    // ============================================================
    SerializationError = 8000,
    DeserializationError = 8001,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    InvalidParameter = 9001,
    ResourceClosed = 9005,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl ErrorCode {
    /// 获取错误代码的数字值
    #[inline]
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::ConnectionTimeout => "CONNECTION_TIMEOUT",
            ErrorCode::ConnectionClosed => "CONNECTION_CLOSED",
            ErrorCode::SessionExpired => "SESSION_EXPIRED",
            ErrorCode::NodeNotFound => "NODE_NOT_FOUND",
            ErrorCode::NodeExists => "NODE_EXISTS",
            ErrorCode::NodeNotEmpty => "NODE_NOT_EMPTY",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::DeserializationError => "DESERIALIZATION_ERROR",
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ResourceClosed => "RESOURCE_CLOSED",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Connection,
            2000..=2999 => ErrorCategory::Node,
            6000..=6999 => ErrorCategory::System,
            8000..=8999 => ErrorCategory::Serialization,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否为可重试的错误
    ///
    /// 只有构造期错误需要调用方判断是否重试，后台协调失败一律按致命错误处理
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::ConnectionClosed
                | ErrorCode::SessionExpired
        )
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Connection,
    Node,
    System,
    Serialization,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Connection => write!(f, "CONNECTION"),
            ErrorCategory::Node => write!(f, "NODE"),
            ErrorCategory::System => write!(f, "SYSTEM"),
            ErrorCategory::Serialization => write!(f, "SERIALIZATION"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
