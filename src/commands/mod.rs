//! CLI 命令处理模块
//!
//! 命令行解析与各子命令实现

pub mod parser;
pub mod run;
pub mod slots;
pub mod status;

pub use parser::*;
