//! Crash handling
//!
//! A panic or a fatal signal must not leave camera capture processes
//! running on the host. Both paths kill every registered capture process
//! group first, then append a report to `crash.log` in the log directory.
//!
//! SIGINT, SIGTERM and SIGHUP are not handled here; they go through the
//! graceful shutdown in `main`.

use std::fs::OpenOptions;
use std::io::Write;
use std::any::Any;
use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::error;

use crate::capture::process;

static CRASH_LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Crash log descriptor for the signal handler, opened before any signal
#[cfg(unix)]
static CRASH_LOG_FD: OnceLock<std::os::unix::io::RawFd> = OnceLock::new();

const CRASH_LOG_FILENAME: &str = "crash.log";

#[cfg(unix)]
const FATAL_SIGNALS: [(libc::c_int, &str); 5] = [
    (libc::SIGSEGV, "SIGSEGV (Segmentation fault)"),
    (libc::SIGABRT, "SIGABRT (Abort)"),
    (libc::SIGBUS, "SIGBUS (Bus error)"),
    (libc::SIGFPE, "SIGFPE (Floating point exception)"),
    (libc::SIGILL, "SIGILL (Illegal instruction)"),
];

/// Install the panic hook and the fatal signal handlers.
///
/// Returns the path of the crash log.
pub fn init_crash_handler(log_dir: &Path) -> std::io::Result<PathBuf> {
    let crash_log_path = log_dir.join(CRASH_LOG_FILENAME);
    let _ = CRASH_LOG_PATH.set(crash_log_path.clone());

    #[cfg(unix)]
    {
        use std::os::unix::io::IntoRawFd;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&crash_log_path)?;
        let _ = CRASH_LOG_FD.set(file.into_raw_fd());
    }

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        process::kill_registered();
        handle_panic(panic_info.payload(), panic_info.location());
        default_hook(panic_info);
    }));

    #[cfg(unix)]
    // SAFETY: the handler only touches atomics and calls async-signal-safe libc functions
    unsafe {
        install_signal_handlers();
    }

    Ok(crash_log_path)
}

fn handle_panic(payload: &(dyn Any + Send), location: Option<&Location<'_>>) {
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");

    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "Unknown panic payload".to_string());

    let location = location
        .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
        .unwrap_or_else(|| "unknown location".to_string());

    let backtrace = std::backtrace::Backtrace::force_capture();
    let report = panic_report(&timestamp.to_string(), &location, &message, &backtrace.to_string());

    if let Some(path) = CRASH_LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(report.as_bytes());
            let _ = file.sync_all();
        }
    }

    error!(
        "PANIC at {}: {} (capture processes killed, see crash.log)",
        location, message
    );
}

fn panic_report(timestamp: &str, location: &str, message: &str, backtrace: &str) -> String {
    let rule = "=".repeat(80);
    format!(
        "\n{rule}\nPANIC at {timestamp}\n{rule}\nLocation: {location}\nMessage: {message}\n\nBacktrace:\n{backtrace}\n{rule}\n"
    )
}

#[cfg(unix)]
unsafe fn install_signal_handlers() {
    for (sig, _) in FATAL_SIGNALS {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = signal_handler as libc::sighandler_t;
        // Back to the default disposition once handled, so the re-raise terminates
        action.sa_flags = libc::SA_RESETHAND | libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(sig, &action, std::ptr::null_mut());
    }
}

/// Must only use async-signal-safe operations
#[cfg(unix)]
extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    process::kill_registered();

    let name = FATAL_SIGNALS
        .iter()
        .find(|(s, _)| *s == sig)
        .map(|(_, name)| *name)
        .unwrap_or("Unknown signal");

    let fault_addr = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO
        unsafe { (*info).si_addr() as usize }
    };

    let mut report = StackReport::new();
    report.push(b"\n================================================================================\nCRASH: ");
    report.push(name.as_bytes());
    report.push(b" (signal ");
    report.push_number(sig as usize, 10);
    report.push(b")");
    if fault_addr != 0 {
        report.push(b"\nFault address: 0x");
        report.push_number(fault_addr, 16);
    }
    report.push(b"\nCapture processes killed");
    report.push(b"\n================================================================================\n");

    let bytes = report.as_bytes();
    // SAFETY: write, fsync, signal and raise are async-signal-safe
    unsafe {
        if let Some(&fd) = CRASH_LOG_FD.get() {
            libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
            libc::fsync(fd);
        }
        libc::write(2, bytes.as_ptr() as *const libc::c_void, bytes.len());

        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Fixed buffer for building a report without allocating.
/// Writes past the end are dropped.
#[cfg_attr(not(unix), allow(dead_code))]
struct StackReport {
    buf: [u8; 512],
    len: usize,
}

#[cfg_attr(not(unix), allow(dead_code))]
impl StackReport {
    const fn new() -> Self {
        Self {
            buf: [0; 512],
            len: 0,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    fn push_number(&mut self, mut n: usize, radix: usize) {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut tmp = [0u8; 64];
        let mut i = tmp.len();
        loop {
            i -= 1;
            tmp[i] = DIGITS[n % radix];
            n /= radix;
            if n == 0 {
                break;
            }
        }
        self.push(&tmp[i..]);
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_report_numbers() {
        let mut report = StackReport::new();
        report.push(b"signal ");
        report.push_number(11, 10);
        report.push(b" at 0x");
        report.push_number(0xdead_beef, 16);
        report.push(b" ");
        report.push_number(0, 10);
        assert_eq!(report.as_bytes(), b"signal 11 at 0xdeadbeef 0");
    }

    #[test]
    fn test_stack_report_truncates() {
        let mut report = StackReport::new();
        for _ in 0..100 {
            report.push(b"0123456789");
        }
        assert_eq!(report.as_bytes().len(), 512);
    }

    #[test]
    fn test_panic_report_layout() {
        let report = panic_report("2024-04-05T14:03:07.000Z", "src/main.rs:1:1", "boom", "<bt>");
        assert!(report.contains("PANIC at 2024-04-05T14:03:07.000Z"));
        assert!(report.contains("Location: src/main.rs:1:1"));
        assert!(report.contains("Message: boom"));
        assert!(report.ends_with(&format!("{}\n", "=".repeat(80))));
    }
}
