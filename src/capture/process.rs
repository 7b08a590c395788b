//! Platform shim for tearing down capture children as a unit
//!
//! Unix: every child leads its own process group, and the whole group is
//! signalled. Windows: every child is attached to one job object marked
//! kill-on-close, so the children die with the recorder even if it is
//! killed itself.
//!
//! Live children are also kept in a fixed-size registry of atomics. The
//! crash handler walks it from a signal handler, so it must not allocate
//! or lock.

use std::sync::atomic::{AtomicI32, Ordering};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

const MAX_TRACKED: usize = 64;

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: AtomicI32 = AtomicI32::new(0);

/// Pids (unix: group ids) of live capture children; 0 marks a free slot
static LIVE_CHILDREN: [AtomicI32; MAX_TRACKED] = [EMPTY_SLOT; MAX_TRACKED];

/// Fails when this host cannot tear down descendants reliably
pub fn ensure_supported() -> Result<(), String> {
    #[cfg(windows)]
    if job::handle().is_none() {
        return Err("could not create the kill-on-close job object".to_string());
    }

    #[cfg(not(any(unix, windows)))]
    return Err("no process group or job object support on this platform".to_string());

    Ok(())
}

/// Configure a command so its child can be torn down with its descendants
pub fn prepare(cmd: &mut Command) {
    cmd.kill_on_drop(true);

    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use windows::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP.0);
    }
}

/// Register a freshly spawned child; on Windows also attach it to the job
pub fn adopt(child: &Child) -> std::io::Result<Option<u32>> {
    let Some(pid) = child.id() else {
        return Ok(None);
    };

    #[cfg(windows)]
    job::attach(child)?;

    register(pid);
    Ok(Some(pid))
}

/// Forget a child that has been reaped
pub fn release(pid: u32) {
    let pid = pid as i32;
    for slot in LIVE_CHILDREN.iter() {
        if slot
            .compare_exchange(pid, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
}

fn register(pid: u32) {
    let pid = pid as i32;
    for slot in LIVE_CHILDREN.iter() {
        if slot
            .compare_exchange(0, pid, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return;
        }
    }
    warn!("Child registry full, pid {} will not be torn down on crash", pid);
}

/// Whether a pid is currently registered
#[cfg(test)]
pub fn is_registered(pid: u32) -> bool {
    let pid = pid as i32;
    LIVE_CHILDREN
        .iter()
        .any(|slot| slot.load(Ordering::SeqCst) == pid)
}

/// Kill a child and its descendants
pub fn kill_tree(pid: u32) {
    #[cfg(unix)]
    {
        // SAFETY: killpg has no memory-safety preconditions
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            debug!(
                "killpg({}) failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/T", "/F", "/PID", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if let Err(e) = status {
            debug!("taskkill {} failed: {}", pid, e);
        }
    }
}

/// Kill every registered child.
///
/// Async-signal-safe on unix: only atomics and `killpg`.
pub fn kill_registered() {
    for slot in LIVE_CHILDREN.iter() {
        let pid = slot.load(Ordering::SeqCst);
        if pid == 0 {
            continue;
        }

        #[cfg(unix)]
        // SAFETY: killpg is async-signal-safe and has no memory preconditions
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }

        #[cfg(not(unix))]
        kill_tree(pid as u32);
    }
}

#[cfg(windows)]
mod job {
    use std::ffi::c_void;
    use std::sync::OnceLock;
    use tokio::process::Child;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    /// The process-wide job; the handle stays open until the process dies
    static JOB: OnceLock<Option<isize>> = OnceLock::new();

    pub(super) fn handle() -> Option<HANDLE> {
        let raw = JOB.get_or_init(|| {
            // SAFETY: plain Win32 calls on a handle we own
            unsafe {
                let job = CreateJobObjectW(None, PCWSTR::null()).ok()?;
                let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
                SetInformationJobObject(
                    job,
                    JobObjectExtendedLimitInformation,
                    &info as *const _ as *const c_void,
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                )
                .ok()?;
                Some(job.0 as isize)
            }
        });
        raw.map(|h| HANDLE(h as *mut c_void))
    }

    pub(super) fn attach(child: &Child) -> std::io::Result<()> {
        let job = handle().ok_or_else(|| std::io::Error::other("job object unavailable"))?;
        let process = child
            .raw_handle()
            .ok_or_else(|| std::io::Error::other("child has no process handle"))?;
        // SAFETY: both handles are valid for the duration of the call
        unsafe { AssignProcessToJobObject(job, HANDLE(process as *mut c_void)) }
            .map_err(std::io::Error::other)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_register_and_release() {
        register(999_001);
        assert!(is_registered(999_001));
        release(999_001);
        assert!(!is_registered(999_001));
    }

    #[cfg(target_os = "linux")]
    fn is_gone(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            // the state field follows the parenthesized command name
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    #[tokio::test]
    async fn test_kill_tree_takes_descendants_down() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 30 & echo $!; wait"]);
        cmd.stdout(Stdio::piped());
        prepare(&mut cmd);

        let mut child = cmd.spawn().unwrap();
        let pid = adopt(&child).unwrap().unwrap();
        assert!(is_registered(pid));

        let stdout = child.stdout.take().unwrap();
        let mut lines = BufReader::new(stdout).lines();
        let grandchild: u32 = lines.next_line().await.unwrap().unwrap().trim().parse().unwrap();

        kill_tree(pid);
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .expect("child should exit within 2s")
            .unwrap();
        assert!(!status.success());
        release(pid);
        assert!(!is_registered(pid));

        #[cfg(target_os = "linux")]
        {
            let deadline = std::time::Instant::now() + Duration::from_secs(2);
            while !is_gone(grandchild) && std::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            assert!(is_gone(grandchild), "grandchild {} survived", grandchild);
        }
        let _ = grandchild;
    }
}
