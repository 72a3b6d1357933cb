//! Demo worker: counts through `--steps` units of work, checkpointing as it
//! goes, and follows the supervisor's commands.

use clap::Parser;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;
use taskwarden::app_msg::{AppStatus, ControlCommand};
use taskwarden::logging::{info, init_logger, warn};
use taskwarden::worker::WorkerSession;

#[derive(Parser, Debug)]
#[command(name = "taskwarden-worker", about = "Example worker for taskwarden slots", version)]
struct Args {
    /// Units of work to do
    #[arg(long, default_value_t = 10)]
    steps: u32,
    /// Wall time per unit, in milliseconds
    #[arg(long, default_value_t = 100)]
    step_ms: u64,
    /// Checkpoint every N units (0 = never)
    #[arg(long, default_value_t = 1)]
    checkpoint_every: u32,
    /// Keep working after a quit command
    #[arg(long)]
    ignore_quit: bool,
    /// Exit without leaving the finish marker
    #[arg(long)]
    no_finish: bool,
    /// Exit code once the work is done
    #[arg(long, default_value_t = 0)]
    exit_code: u8,
    /// Write the unit count to this slot file before finishing
    #[arg(long, value_name = "OPEN_NAME")]
    output: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(err) = init_logger(Some("info"), None) {
        eprintln!("logger: {err}");
    }
    let mut session = match WorkerSession::from_env() {
        Ok(session) => session,
        Err(err) => {
            eprintln!("can't attach to slot: {err}");
            return ExitCode::from(2);
        }
    };
    run(&args, &mut session)
}

fn run(args: &Args, session: &mut WorkerSession) -> ExitCode {
    let step = Duration::from_millis(args.step_ms);
    let mut cpu_time = session.init().checkpoint_cpu_time;
    let mut checkpoint = cpu_time;
    let mut done = (cpu_time / step.as_secs_f64().max(f64::EPSILON)).round() as u32;
    info(format!(
        "worker for {} starting at unit {}/{}",
        session.init().task_name,
        done,
        args.steps
    ));

    while done < args.steps {
        match session.poll_control() {
            Some(ControlCommand::Abort) => {
                warn("aborted by client");
                return ExitCode::from(1);
            }
            Some(ControlCommand::Quit) if !args.ignore_quit => {
                info(format!("quitting at unit {done}"));
                return ExitCode::SUCCESS;
            }
            _ => {}
        }
        session.poll_client();
        if session.is_suspended() {
            thread::sleep(step);
            continue;
        }

        thread::sleep(step);
        cpu_time += step.as_secs_f64();
        done += 1;
        if args.checkpoint_every > 0 && done % args.checkpoint_every == 0 {
            checkpoint = cpu_time;
        }
        session.report_status(&AppStatus {
            current_cpu_time: Some(cpu_time),
            checkpoint_cpu_time: Some(checkpoint),
            fraction_done: Some(f64::from(done) / f64::from(args.steps.max(1))),
            working_set_size: None,
            want_network: Some(false),
            trickle_up: false,
        });
    }

    session.force_status(&AppStatus {
        current_cpu_time: Some(cpu_time),
        checkpoint_cpu_time: Some(checkpoint),
        fraction_done: Some(1.0),
        working_set_size: None,
        want_network: Some(false),
        trickle_up: false,
    });
    if let Some(name) = &args.output {
        if let Err(err) = std::fs::write(session.slot_dir().join(name), format!("{done}\n")) {
            warn(format!("can't write {name}: {err}"));
            return ExitCode::from(1);
        }
    }
    if !args.no_finish {
        if let Err(err) = session.finish() {
            warn(format!("can't write finish marker: {err}"));
            return ExitCode::from(1);
        }
    }
    info(format!("done after {cpu_time:.2}s"));
    ExitCode::from(args.exit_code)
}
