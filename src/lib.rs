//! MEV engine: operation specification and execution core
//! MEV引擎：操作规范与执行核心

// Shared modules / 共享模块
pub mod config;
pub mod storage;
pub mod utils;

// Engine modules (leaves first) / 引擎模块（叶子优先）
pub mod attributes;
pub mod resource_types;
pub mod resources;
pub mod operations;
pub mod conversion;
pub mod execution;

// Service facade / 服务门面
pub mod service;

// Re-exports / 重新导出
pub use attributes::{Attribute, AttributeError, AttributeSpec};
pub use conversion::{ArgumentValidationError, ConvertedArguments, ConverterRegistry};
pub use execution::{ExecutedOperation, ExecutionStatus, JobTracker};
pub use operations::{ExecutionMode, Operation, SpecParseError};
pub use resource_types::{ResourceTypeRegistry, ResourceValidationError};
pub use service::{MevError, MevResult, MevService, SubmitRequest};
