//! run 命令 - 监督 jobs 文件中的任务直至全部结束

use crate::config::SupervisorConfig;
use crate::context::{SupervisorContext, TaskEvent};
use crate::descriptor::{DataDirLayout, TaskDescriptor};
use crate::logging::{info, warn};
use crate::storage::StateFile;
use crate::task_set::ActiveTaskSet;
use anyhow::{Context, Result};
use colored::Colorize;
use serde::Deserialize;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// `{"tasks": [descriptor, ...]}`. Relative paths are taken from the jobs
/// file's directory.
#[derive(Debug, Deserialize)]
pub struct JobsFile {
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub finished: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl RunSummary {
    fn record(&mut self, event: &TaskEvent) {
        match event {
            TaskEvent::Finished { .. } => self.finished += 1,
            TaskEvent::Failed { .. } => self.failed += 1,
            _ => {}
        }
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && !self.interrupted
    }
}

pub fn load_jobs(path: &Path) -> Result<Vec<Arc<TaskDescriptor>>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading jobs file {}", path.display()))?;
    let jobs: JobsFile = serde_json::from_str(&content)
        .with_context(|| format!("parsing jobs file {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    Ok(jobs
        .tasks
        .into_iter()
        .map(|mut descriptor| {
            descriptor.executable = resolve(base, &descriptor.executable);
            for file in descriptor
                .input_files
                .iter_mut()
                .chain(descriptor.output_files.iter_mut())
            {
                file.path = resolve(base, &file.path);
            }
            Arc::new(descriptor)
        })
        .collect())
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub async fn execute(
    config: &SupervisorConfig,
    jobs_path: &Path,
    max_tasks: Option<usize>,
) -> Result<RunSummary> {
    let descriptors = load_jobs(jobs_path)?;
    let layout = DataDirLayout::new(&config.data_dir);
    fs::create_dir_all(layout.slots_dir())
        .with_context(|| format!("creating {}", layout.slots_dir().display()))?;
    let mut ctx = SupervisorContext::system(layout, config.prefs.clone());
    let state_file = StateFile::new(config.state_file_path());

    let mut set = ActiveTaskSet::new();
    let restored = set.load(&ctx, &state_file, |url, name| {
        descriptors
            .iter()
            .find(|d| d.project_url == url && d.name == name)
            .cloned()
    })?;
    if restored > 0 {
        info(format!("restored {restored} tasks from {}", state_file.path().display()));
    }
    let mut pending: VecDeque<Arc<TaskDescriptor>> = descriptors
        .iter()
        .filter(|d| set.lookup(&d.project_url, &d.name).is_none())
        .cloned()
        .collect();
    let limit = max_tasks.unwrap_or(config.max_running_tasks).max(1);
    info(format!(
        "{} tasks to run, at most {} at a time",
        pending.len() + set.len(),
        limit
    ));

    let mut summary = RunSummary::default();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                println!("{}", "Interrupted, stopping tasks...".yellow());
                set.exit_tasks(&mut ctx, None);
                report_events(&mut ctx, &mut summary);
                set.save(&state_file)?;
                summary.interrupted = true;
                return Ok(summary);
            }
            _ = ticker.tick() => {}
        }

        let mut changed = set.start_scheduled(&mut ctx);
        while set.running_count() < limit {
            let Some(descriptor) = pending.pop_front() else {
                break;
            };
            match set.start_task(&mut ctx, descriptor) {
                Ok(_) => changed = true,
                Err(err) => warn(format!("can't start task: {err}")),
            }
        }
        changed |= set.poll(&mut ctx);
        report_events(&mut ctx, &mut summary);
        changed |= set.purge_terminal() > 0;

        if changed {
            if let Err(err) = set.save(&state_file) {
                warn(format!("can't save state: {err}"));
            }
        }
        if pending.is_empty() && set.is_empty() {
            break;
        }
    }

    set.save(&state_file)?;
    Ok(summary)
}

fn report_events(ctx: &mut SupervisorContext, summary: &mut RunSummary) {
    for event in ctx.drain_events() {
        summary.record(&event);
        match &event {
            TaskEvent::Started { task_name, slot, pid, .. } => {
                println!("{} {} (slot {}, pid {})", "▶".cyan(), task_name, slot, pid);
            }
            TaskEvent::Finished { task_name, final_cpu_time, .. } => {
                println!(
                    "{} {} finished ({:.1}s CPU)",
                    "✓".green(),
                    task_name,
                    final_cpu_time
                );
            }
            TaskEvent::Failed { task_name, code, reason, .. } => {
                println!("{} {} failed: {} [{}]", "✗".red(), task_name, reason, code);
            }
            TaskEvent::InputsMissing { task_name, files, .. } => {
                warn(format!("{task_name}: waiting for {}", files.join(", ")));
            }
            TaskEvent::RescheduleRequested { reason } => {
                warn(format!("reschedule requested: {reason}"));
            }
            TaskEvent::Checkpointed { .. } | TaskEvent::TrickleUp { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_paths_resolve_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        fs::write(
            &path,
            r#"{"tasks": [{
                "project_url": "http://p.org/",
                "name": "wu_1",
                "executable": "bin/app",
                "input_files": [{"open_name": "in", "path": "/abs/in"}],
                "output_files": [{"open_name": "out", "path": "out/wu_1"}]
            }]}"#,
        )
        .unwrap();

        let jobs = load_jobs(&path).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].executable, dir.path().join("bin/app"));
        assert_eq!(jobs[0].input_files[0].path, PathBuf::from("/abs/in"));
        assert_eq!(jobs[0].output_files[0].path, dir.path().join("out/wu_1"));
    }

    #[test]
    fn summary_counts_outcomes() {
        let mut summary = RunSummary::default();
        summary.record(&TaskEvent::Finished {
            project_url: "u".into(),
            task_name: "a".into(),
            exit_code: 0,
            final_cpu_time: 1.0,
            stderr_tail: String::new(),
        });
        assert!(summary.success());
        summary.record(&TaskEvent::Failed {
            project_url: "u".into(),
            task_name: "b".into(),
            code: crate::error::ErrorCode::NonzeroExit,
            reason: "exit 1".into(),
            final_cpu_time: 1.0,
            stderr_tail: String::new(),
        });
        assert_eq!(summary, RunSummary { finished: 1, failed: 1, interrupted: false });
        assert!(!summary.success());
    }
}
