//! Pid-level liveness checks and signals for processes the daemon does not hold a
//! child handle for (adopted agent sessions, a detached daemon), plus
//! process-group signals for whole agent trees.

use std::time::Duration;

use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// Signal-0 liveness check. A process owned by another user still counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Sends `signal` to `pid`. A process that is already gone is not an error.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: StopSignal) -> Result<()> {
    use anyhow::Context;

    let raw_pid = i32::try_from(pid).with_context(|| format!("pid {pid} out of range"))?;
    if unsafe { libc::kill(raw_pid, raw_signal(signal)) } != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(error).with_context(|| format!("failed to send {signal:?} to pid {pid}"));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn send_signal(_pid: u32, _signal: StopSignal) -> Result<()> {
    anyhow::bail!("signalling processes is only supported on unix hosts")
}

/// Sends `signal` to every member of process group `pgid`. Agents are
/// launched as group leaders, so their pid doubles as the group id. An empty
/// group is not an error.
#[cfg(unix)]
pub fn signal_process_group(pgid: u32, signal: StopSignal) -> Result<()> {
    use anyhow::Context;

    let raw_pgid = i32::try_from(pgid).with_context(|| format!("pgid {pgid} out of range"))?;
    if raw_pgid <= 1 {
        anyhow::bail!("refusing to signal process group {pgid}");
    }
    if unsafe { libc::kill(-raw_pgid, raw_signal(signal)) } != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(error)
            .with_context(|| format!("failed to send {signal:?} to process group {pgid}"));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_process_group(_pgid: u32, _signal: StopSignal) -> Result<()> {
    anyhow::bail!("signalling processes is only supported on unix hosts")
}

/// True while any member of process group `pgid` is still running.
#[cfg(unix)]
pub fn process_group_alive(pgid: u32) -> bool {
    let Ok(pgid) = i32::try_from(pgid) else {
        return false;
    };
    if pgid <= 1 {
        return false;
    }
    if unsafe { libc::kill(-pgid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(unix)]
fn raw_signal(signal: StopSignal) -> i32 {
    match signal {
        StopSignal::Terminate => libc::SIGTERM,
        StopSignal::Kill => libc::SIGKILL,
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns true when the process
/// exited within the grace period.
pub async fn terminate_gracefully(pid: u32, grace: Duration) -> Result<bool> {
    if !process_alive(pid) {
        return Ok(true);
    }
    send_signal(pid, StopSignal::Terminate)?;
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < grace {
        tokio::time::sleep(step).await;
        waited += step;
        if !process_alive(pid) {
            return Ok(true);
        }
    }
    send_signal(pid, StopSignal::Kill)?;
    Ok(false)
}

/// Dead or a zombie awaiting its new parent's reap.
#[cfg(all(test, unix))]
pub(crate) fn process_exited(pid: u32) -> bool {
    if !process_alive(pid) {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}
