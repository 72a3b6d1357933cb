use std::process::ExitCode;
use taskwarden::commands::{run, slots, status, Cli, Commands};
use taskwarden::config::SupervisorConfig;
use taskwarden::descriptor::DataDirLayout;
use taskwarden::logging::init_logger;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    match main_impl(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::from(1)
        }
    }
}

async fn main_impl(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = SupervisorConfig::load(cli.config.as_deref())?;
    let log_level = cli.log_level.clone().or_else(|| config.log_level.clone());
    init_logger(log_level.as_deref(), config.log_file.clone())?;

    match cli.command {
        Commands::Run { jobs, max_tasks } => {
            let summary = run::execute(&config, &jobs, max_tasks).await?;
            println!(
                "{} finished, {} failed{}",
                summary.finished,
                summary.failed,
                if summary.interrupted { " (interrupted)" } else { "" }
            );
            Ok(if summary.success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Status { state_file, json } => {
            let path = state_file.unwrap_or_else(|| config.state_file_path());
            status::execute(&path, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Slots => {
            slots::execute(&DataDirLayout::new(&config.data_dir))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
