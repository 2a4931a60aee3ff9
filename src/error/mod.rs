//! 错误处理模块
//!
//! 提供统一的错误类型、错误代码分类，以及后台协调任务使用的致命错误通道

pub mod code;
pub mod fatal;
pub mod registry_error;

pub use code::{ErrorCategory, ErrorCode};
pub use fatal::{FatalError, FatalErrorSink, FatalSource};
pub use registry_error::{RegistryError, Result};
