//! Child resource limits applied between fork and exec.

use std::io;

/// Applies the configured limits inside the child's execution context.
/// Address-space ceiling first, then niceness delta; the first failure
/// aborts the exec so a child never runs with half the limits.
///
/// # Safety
///
/// Must only be called from a `pre_exec` hook: it runs after `fork` and
/// touches process-global state.
pub fn apply(memory_limit_mb: Option<u64>, cpu_nice: Option<i32>) -> io::Result<()> {
    if let Some(mb) = memory_limit_mb {
        let bytes = (mb as libc::rlim_t).saturating_mul(1024 * 1024);
        let limit = libc::rlimit {
            rlim_cur: bytes,
            rlim_max: bytes,
        };
        if unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    if let Some(delta) = cpu_nice {
        // nice(2) legitimately returns -1 for a resulting niceness of -1;
        // only a set errno indicates failure.
        unsafe { *libc::__errno_location() = 0 };
        if unsafe { libc::nice(delta) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Probes whether `pid` names a live process. EPERM means the process
/// exists but is owned by someone else, which still counts as alive.
pub fn process_alive(pid: u32) -> bool {
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn absent_pid_is_dead() {
        // PID range tops out well below this on Linux defaults.
        assert!(!process_alive(4_000_000));
    }
}
