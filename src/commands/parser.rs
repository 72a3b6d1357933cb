//! CLI 命令行参数解析
//!
//! 使用 clap 定义命令行接口

use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Supervise the tasks of a jobs file until they are all done
    Run {
        /// JSON file listing task descriptors
        #[arg(value_name = "JOBS")]
        jobs: PathBuf,
        /// Run at most this many tasks at once
        #[arg(long)]
        max_tasks: Option<usize>,
    },

    /// Show the tasks recorded in a state file
    Status {
        /// State file to read (defaults to the configured one)
        #[arg(long)]
        state_file: Option<PathBuf>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// List slot directories and whether a live worker holds them
    Slots,
}

/// Taskwarden - active task supervisor
#[derive(Parser, Debug, Clone)]
#[command(
    name = "taskwarden",
    about = "Runs untrusted worker processes in slots and keeps them within bounds",
    version,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Config file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "info,taskwarden=trace"
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse_from_args(std::env::args_os())
    }

    /// 尝试解析命令行参数（用于测试或自定义 argv）
    pub fn try_parse_args_from<I, T>(iter: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Cli::try_parse_from(iter)
    }

    /// 解析命令行参数（失败时由 clap 处理错误输出和退出）
    pub fn parse_from_args<I, T>(iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_args_from(iter) {
            Ok(cli) => cli,
            Err(err) => err.exit(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_limit() {
        let cli = Cli::try_parse_args_from(["taskwarden", "run", "jobs.json", "--max-tasks", "2"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Run {
                jobs: PathBuf::from("jobs.json"),
                max_tasks: Some(2),
            }
        );
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_args_from(["taskwarden", "status", "--json", "--config", "tw.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("tw.toml")));
        assert!(matches!(cli.command, Commands::Status { json: true, .. }));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_args_from(["taskwarden"]).is_err());
    }
}
