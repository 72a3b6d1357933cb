//! 日志系统
//!
//! 基于 tracing 的统一日志记录；`debug/info/warn/error` 接受已格式化的消息。

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn debug(message: impl AsRef<str>) {
    tracing::debug!(target: "taskwarden", "{}", message.as_ref());
}

pub fn info(message: impl AsRef<str>) {
    tracing::info!(target: "taskwarden", "{}", message.as_ref());
}

pub fn warn(message: impl AsRef<str>) {
    tracing::warn!(target: "taskwarden", "{}", message.as_ref());
}

pub fn error(message: impl AsRef<str>) {
    tracing::error!(target: "taskwarden", "{}", message.as_ref());
}

/// Log an inconsistency that was dropped instead of corrupting state.
pub fn internal_error(message: impl AsRef<str>) {
    tracing::error!(target: "taskwarden", "internal error: {}", message.as_ref());
}

/// 初始化日志系统
///
/// # Arguments
/// * `log_level` - 日志级别，如果为 None 则使用环境变量 RUST_LOG
/// * `log_file` - 日志文件路径，如果为 None 则只输出到标准错误
pub fn init_logger(log_level: Option<&str>, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = if let Some(level) = log_level {
        EnvFilter::try_new(level)?
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,taskwarden=debug"))
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(true)
        .compact();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if let Some(log_path) = log_file {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let file_layer = fmt::layer()
            .with_writer(std::sync::Arc::new(file))
            .with_target(true)
            .with_ansi(false)
            .with_level(true);

        registry.with(file_layer).try_init()?;
    } else {
        registry.try_init()?;
    }

    tracing::info!("Logger initialized");
    Ok(())
}
