//! Per-process resource sampling
//!
//! Platform strategy:
//! - Linux/macOS: psutil for memory, CPU times and (Linux) major page faults
//! - Windows: sysinfo

use crate::error::SampleError;
use std::collections::HashMap;
use std::path::Path;
use walkdir::WalkDir;

/// One raw reading for one process.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcSample {
    pub working_set_size: f64,
    pub swap_size: f64,
    pub page_fault_count: f64,
    pub user_time: f64,
    pub kernel_time: f64,
}

/// What the supervisor knows about a task's resource use. Sampled only,
/// never written back to the OS.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceSnapshot {
    pub working_set_size: f64,
    pub working_set_size_smoothed: f64,
    pub swap_size: f64,
    pub page_fault_count: f64,
    pub page_fault_rate: f64,
    pub user_time: f64,
    pub kernel_time: f64,
    sampled: bool,
}

impl ResourceSnapshot {
    /// Fold in a new sample taken `elapsed` seconds after the previous one.
    pub fn update(&mut self, sample: &ProcSample, elapsed: f64) {
        if self.sampled {
            self.working_set_size_smoothed =
                0.5 * self.working_set_size_smoothed + 0.5 * sample.working_set_size;
            self.page_fault_rate = if elapsed > 0.0 {
                ((sample.page_fault_count - self.page_fault_count) / elapsed).max(0.0)
            } else {
                0.0
            };
        } else {
            self.working_set_size_smoothed = sample.working_set_size;
            self.page_fault_rate = 0.0;
            self.sampled = true;
        }
        self.working_set_size = sample.working_set_size;
        self.swap_size = sample.swap_size;
        self.page_fault_count = sample.page_fault_count;
        self.user_time = sample.user_time;
        self.kernel_time = sample.kernel_time;
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    /// Forget history, e.g. when a new process takes over the task.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn cpu_time(&self) -> f64 {
        self.user_time + self.kernel_time
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ProcessSampler: Send {
    /// Sample every pid in `pids`. Pids that vanished are left out of the
    /// map; an error means the whole batch is unusable.
    fn sample(&mut self, pids: &[u32]) -> Result<HashMap<u32, ProcSample>, SampleError>;
}

#[derive(Debug, Default)]
pub struct OsSampler;

#[cfg(unix)]
impl ProcessSampler for OsSampler {
    fn sample(&mut self, pids: &[u32]) -> Result<HashMap<u32, ProcSample>, SampleError> {
        use psutil::process::Process;

        let mut samples = HashMap::new();
        let mut last_error = None;
        for &pid in pids {
            let process = match Process::new(pid) {
                Ok(process) => process,
                Err(err) => {
                    last_error = Some(format!("{err:?}"));
                    continue;
                }
            };
            let mut sample = ProcSample::default();
            if let Ok(memory) = process.memory_info() {
                sample.working_set_size = memory.rss() as f64;
                sample.swap_size = memory.vms() as f64;
            }
            if let Ok(times) = process.cpu_times() {
                sample.user_time = times.user().as_secs_f64();
                sample.kernel_time = times.system().as_secs_f64();
            }
            #[cfg(target_os = "linux")]
            if let Some(majflt) = major_faults(pid) {
                sample.page_fault_count = majflt;
            }
            samples.insert(pid, sample);
        }
        if samples.is_empty() {
            if let Some(err) = last_error {
                return Err(SampleError::Unavailable(err));
            }
        }
        Ok(samples)
    }
}

/// Field 12 of `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn major_faults(pid: u32) -> Option<f64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces; the fixed fields start after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(9)?.parse().ok()
}

#[cfg(windows)]
impl ProcessSampler for OsSampler {
    fn sample(&mut self, pids: &[u32]) -> Result<HashMap<u32, ProcSample>, SampleError> {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let sys_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&sys_pids),
            true,
            ProcessRefreshKind::everything(),
        );
        Ok(pids
            .iter()
            .filter_map(|pid| {
                system.process(Pid::from_u32(*pid)).map(|process| {
                    let sample = ProcSample {
                        working_set_size: process.memory() as f64,
                        swap_size: process.virtual_memory() as f64,
                        ..ProcSample::default()
                    };
                    (*pid, sample)
                })
            })
            .collect())
    }
}

/// Physical memory of the host in bytes, 0 if unknown.
pub fn host_total_ram() -> f64 {
    #[cfg(unix)]
    {
        psutil::memory::virtual_memory()
            .map(|mem| mem.total() as f64)
            .unwrap_or(0.0)
    }
    #[cfg(windows)]
    {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.total_memory() as f64
    }
}

/// Total size of regular files under `dir`.
pub fn dir_size(dir: &Path) -> f64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len() as f64)
        .sum()
}
