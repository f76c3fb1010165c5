//! Utility modules / 工具模块

pub mod error_macros;
