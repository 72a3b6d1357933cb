use super::ExitOutcome;
use nix::sys::signal::Signal;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};

/// Prepare the execution environment for a worker process
///
/// Own process group, idle priority, and on Linux a death signal so workers
/// don't outlive a crashed client.
pub fn prepare_command(cmd: &mut Command) -> io::Result<()> {
    use std::os::unix::process::CommandExt;

    // Use RAII pattern to wrap unsafe operations
    unsafe {
        cmd.pre_exec(|| {
            if set_process_group() != 0 {
                return Err(io::Error::last_os_error());
            }

            // best effort; a worker at normal priority still works
            let _ = set_idle_priority();

            #[cfg(target_os = "linux")]
            {
                if set_parent_death_signal() != 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    Ok(())
}

/// Check if process is alive
pub fn process_alive(pid: u32) -> bool {
    let c_pid = pid as libc::pid_t;
    if c_pid <= 0 {
        return false;
    }
    match unsafe_send_signal(c_pid, 0) {
        Ok(_) => true,
        Err(errno) => errno == libc::EPERM, // EPERM means process exists but no permission
    }
}

pub fn classify_exit(status: ExitStatus) -> ExitOutcome {
    if let Some(code) = status.code() {
        ExitOutcome::Clean(code)
    } else if let Some(sig) = status.signal() {
        ExitOutcome::Signaled(sig)
    } else {
        ExitOutcome::PlatformSpecial {
            tag: "unknown_status",
            restartable: false,
        }
    }
}

/// Signals that mean "somebody stopped the worker", not "the worker broke".
pub fn is_benign_signal(sig: i32) -> bool {
    matches!(
        Signal::try_from(sig),
        Ok(Signal::SIGHUP
            | Signal::SIGINT
            | Signal::SIGQUIT
            | Signal::SIGKILL
            | Signal::SIGTERM
            | Signal::SIGSTOP)
    )
}

/// Encapsulates unsafe setpgid call
unsafe fn set_process_group() -> libc::c_int {
    unsafe { libc::setpgid(0, 0) }
}

unsafe fn set_idle_priority() -> libc::c_int {
    unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, 19) }
}

/// Encapsulates unsafe prctl call
#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> libc::c_int {
    unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) }
}

/// Encapsulates unsafe kill call and returns Result instead of raw error code
fn unsafe_send_signal(pid: libc::pid_t, signal: libc::c_int) -> Result<(), libc::c_int> {
    let result = unsafe { libc::kill(pid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}
