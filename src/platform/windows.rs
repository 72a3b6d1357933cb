use super::ExitOutcome;
use std::io;
use std::process::{Command, ExitStatus};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

const STATUS_DLL_INIT_FAILED: u32 = 0xC000_0142;
const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;
const STATUS_ACCESS_VIOLATION: u32 = 0xC000_0005;

pub fn prepare_command(cmd: &mut Command) -> io::Result<()> {
    use std::os::windows::process::CommandExt;

    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const IDLE_PRIORITY_CLASS: u32 = 0x0000_0040;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP | IDLE_PRIORITY_CLASS | CREATE_NO_WINDOW);
    Ok(())
}

pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let mut system = System::new();
    let sys_pid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[sys_pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(sys_pid).is_some()
}

/// Magic NTSTATUS exit codes become tagged outcomes before the state
/// machine sees them.
pub fn classify_exit(status: ExitStatus) -> ExitOutcome {
    let Some(code) = status.code() else {
        return ExitOutcome::PlatformSpecial {
            tag: "unknown_status",
            restartable: false,
        };
    };
    match code as u32 {
        // happens when the desktop heap runs out; the worker itself is fine
        STATUS_DLL_INIT_FAILED => ExitOutcome::PlatformSpecial {
            tag: "dll_init_failed",
            restartable: true,
        },
        STATUS_CONTROL_C_EXIT => ExitOutcome::PlatformSpecial {
            tag: "control_c_exit",
            restartable: true,
        },
        STATUS_ACCESS_VIOLATION => ExitOutcome::PlatformSpecial {
            tag: "access_violation",
            restartable: false,
        },
        _ => ExitOutcome::Clean(code),
    }
}

/// Windows has no signals; every exit arrives as a code.
pub fn is_benign_signal(_sig: i32) -> bool {
    false
}
