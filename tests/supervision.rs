//! 真实进程监督测试
//!
//! Runs real workers (the demo worker binary and small shell scripts) in a
//! temporary data directory with OS shared memory.

#![cfg(unix)]

use serial_test::serial;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use taskwarden::commands::run;
use taskwarden::config::{ClientPrefs, SupervisorConfig, EXIT_WAIT};
use taskwarden::descriptor::{FileRef, PathLayout};
use taskwarden::{
    ActiveTaskSet, DataDirLayout, SchedulerState, SupervisorContext, TaskDescriptor, TaskEvent,
    TaskState,
};
use tempfile::TempDir;

const WORKER: &str = env!("CARGO_BIN_EXE_taskwarden-worker");

fn context(dir: &TempDir) -> SupervisorContext {
    let layout = DataDirLayout::new(dir.path());
    fs::create_dir_all(layout.slots_dir()).unwrap();
    SupervisorContext::system(layout, ClientPrefs::default())
}

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Poll until `done` holds or `limit` passes, collecting events.
fn poll_until(
    set: &mut ActiveTaskSet,
    ctx: &mut SupervisorContext,
    limit: Duration,
    mut done: impl FnMut(&ActiveTaskSet, &[TaskEvent]) -> bool,
) -> Vec<TaskEvent> {
    let started = Instant::now();
    let mut events = Vec::new();
    while started.elapsed() < limit {
        set.poll(ctx);
        events.extend(ctx.drain_events());
        if done(set, &events) {
            break;
        }
        thread::sleep(Duration::from_millis(200));
    }
    events
}

#[test]
#[serial]
fn demo_worker_runs_to_completion() {
    let dir = TempDir::new().unwrap();
    let mut ctx = context(&dir);
    let out = dir.path().join("results").join("wu_1.out");
    let mut descriptor = TaskDescriptor::new("http://p.org/", "wu_1", WORKER);
    descriptor.command_line = "--steps 3 --step-ms 50 --output result".to_string();
    descriptor.output_files.push(FileRef {
        open_name: "result".to_string(),
        path: out.clone(),
    });

    let mut set = ActiveTaskSet::new();
    let slot = set.start_task(&mut ctx, Arc::new(descriptor)).unwrap();
    assert_eq!(slot, 0);
    assert!(set.get(0).unwrap().has_process());

    let events = poll_until(&mut set, &mut ctx, Duration::from_secs(30), |_, events| {
        events.iter().any(|e| matches!(e, TaskEvent::Finished { .. } | TaskEvent::Failed { .. }))
    });

    assert!(events.iter().any(|e| matches!(e, TaskEvent::Started { slot: 0, .. })));
    let finished = events
        .iter()
        .find_map(|e| match e {
            TaskEvent::Finished { exit_code, stderr_tail, .. } => Some((*exit_code, stderr_tail.clone())),
            _ => None,
        })
        .expect("worker should finish");
    assert_eq!(finished.0, 0);
    assert!(finished.1.contains("done after"), "stderr tail: {}", finished.1);
    assert_eq!(fs::read_to_string(&out).unwrap(), "3\n");

    let task = set.get(0).unwrap();
    assert_eq!(task.state(), TaskState::Exited);
    assert!(task.fraction_done > 0.99);
    assert_eq!(fs::read_dir(ctx.layout.slot_dir(0)).unwrap().count(), 0);
    assert_eq!(set.purge_terminal(), 1);
}

#[test]
#[serial]
fn worker_ignoring_quit_is_killed() {
    let dir = TempDir::new().unwrap();
    let mut ctx = context(&dir);
    let exe = script(dir.path(), "stubborn.sh", "trap '' TERM\nwhile true; do sleep 1; done");

    let mut set = ActiveTaskSet::new();
    set.start_task(&mut ctx, Arc::new(TaskDescriptor::new("http://p.org/", "stubborn", exe)))
        .unwrap();
    assert!(set.get(0).unwrap().has_process());

    let started = Instant::now();
    set.exit_tasks(&mut ctx, None);

    assert!(started.elapsed() >= EXIT_WAIT);
    let task = set.get(0).unwrap();
    assert!(!task.has_process());
    assert_eq!(task.state(), TaskState::Uninitialized);
    assert!(!ctx.drain_events().iter().any(|e| matches!(e, TaskEvent::Failed { .. })));
}

#[test]
#[serial]
fn exit_without_finish_marker_restarts() {
    let dir = TempDir::new().unwrap();
    let mut ctx = context(&dir);
    let exe = script(dir.path(), "quick.sh", "exit 0");

    let mut set = ActiveTaskSet::new();
    set.start_task(&mut ctx, Arc::new(TaskDescriptor::new("http://p.org/", "quick", exe)))
        .unwrap();

    let events = poll_until(&mut set, &mut ctx, Duration::from_secs(10), |set, _| {
        set.get(0).map(|t| t.premature_exit_count) == Some(1)
    });

    let task = set.get(0).unwrap();
    assert_eq!(task.premature_exit_count, 1);
    assert_eq!(task.state(), TaskState::Uninitialized);
    assert_eq!(task.scheduler_state, SchedulerState::Scheduled);
    assert!(!events.iter().any(|e| matches!(e, TaskEvent::Failed { .. } | TaskEvent::Finished { .. })));

    assert!(set.start_scheduled(&mut ctx));
    assert_eq!(set.get(0).unwrap().state(), TaskState::Executing);
    set.kill_tasks(&mut ctx, None);
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn run_command_finishes_jobs_file() {
    let dir = TempDir::new().unwrap();
    let jobs = dir.path().join("jobs.json");
    fs::write(
        &jobs,
        serde_json::json!({
            "tasks": [
                {"project_url": "http://p.org/", "name": "a", "executable": WORKER,
                 "command_line": "--steps 2 --step-ms 20"},
                {"project_url": "http://p.org/", "name": "b", "executable": WORKER,
                 "command_line": "--steps 2 --step-ms 20 --exit-code 3"}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let config = SupervisorConfig {
        data_dir: dir.path().join("data"),
        max_running_tasks: 1,
        ..SupervisorConfig::default()
    };

    let summary = run::execute(&config, &jobs, None).await.unwrap();

    assert_eq!(summary.finished, 1);
    assert_eq!(summary.failed, 1);
    assert!(!summary.success());
    let saved = taskwarden::StateFile::new(config.state_file_path()).load().unwrap();
    assert!(saved.is_empty());
}
