//! Capture driver contract
//!
//! A capture driver launches one child process per camera per attempt. The
//! child writes one container file until it is asked to stop. The same
//! driver produces the published clip by trimming that file afterwards.
//!
//! Children are always placed where the platform can tear them down as a
//! unit (a process group on unix, a kill-on-close job object on Windows),
//! so that no capture process outlives the recorder.

mod ffmpeg;
pub mod process;

#[cfg(test)]
pub(crate) mod fake;

pub use ffmpeg::{FfmpegDriver, FfmpegSettings};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, ChildStdin};

use crate::config::CameraConfig;

/// Errors reported by a capture driver
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The child could not be launched at all
    #[error("capture program unavailable: {0}")]
    Unavailable(String),

    /// The camera's input or the requested paths were rejected
    #[error("bad capture input: {0}")]
    BadInput(String),

    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The child is no longer there to talk to
    #[error("capture process is gone")]
    Gone,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Every trim attempt failed
    #[error("trim failed after {attempts} attempts: {reason}")]
    TrimFailed { attempts: u32, reason: String },
}

/// How a capture child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, if the child exited normally
    pub code: Option<i32>,
    pub success: bool,
}

/// The live side of a capture handle: the child and its control stream
#[derive(Debug)]
pub struct CaptureProcess {
    pub(crate) child: Child,
    pub(crate) stdin: Option<ChildStdin>,
    pub(crate) pid: Option<u32>,
}

impl Drop for CaptureProcess {
    /// The registry slot goes away with the child, whichever path drops it
    fn drop(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        if matches!(self.child.try_wait(), Ok(None)) {
            process::kill_tree(pid);
        }
        process::release(pid);
    }
}

/// One running capture for one camera.
///
/// Owned exclusively by the supervisor; dropped after `wait` returns.
#[derive(Debug)]
pub struct CaptureHandle {
    pub camera: u32,
    pub working_path: PathBuf,
    pub recode_on_finalize: bool,
    process: Option<CaptureProcess>,
}

impl CaptureHandle {
    pub fn new(
        camera: &CameraConfig,
        working_path: PathBuf,
        process: Option<CaptureProcess>,
    ) -> Self {
        Self {
            camera: camera.index,
            working_path,
            recode_on_finalize: camera.recode_on_finalize,
            process,
        }
    }

    pub(crate) fn process_mut(&mut self) -> Option<&mut CaptureProcess> {
        self.process.as_mut()
    }

    pub(crate) fn take_process(&mut self) -> Option<CaptureProcess> {
        self.process.take()
    }
}

/// A request to publish part of a working file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimRequest {
    pub camera: u32,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Skip this much of the input; 0 keeps everything
    pub start_offset_ms: i64,
    /// Re-encode to H.264/yuv420p instead of stream copy
    pub recode: bool,
}

/// Launches and controls capture children
#[async_trait]
pub trait CaptureDriver: Send + Sync {
    /// Launch the child for one camera writing to `output`.
    /// Returns as soon as the child is running.
    async fn start(
        &self,
        camera: &CameraConfig,
        output: &Path,
    ) -> Result<CaptureHandle, CaptureError>;

    /// Send the graceful stop token, then close the control stream
    async fn request_stop(&self, handle: &mut CaptureHandle) -> Result<(), CaptureError>;

    /// Wait for the child to exit, at most `deadline`
    async fn wait(
        &self,
        handle: &mut CaptureHandle,
        deadline: Duration,
    ) -> Result<ExitInfo, CaptureError>;

    /// Report a child that has exited on its own. The handle keeps only its
    /// working path afterwards.
    fn exited(&self, handle: &mut CaptureHandle) -> Option<ExitInfo>;

    /// Kill the child and everything it spawned
    fn force_kill(&self, handle: &mut CaptureHandle);

    /// Produce `request.output` from `request.input`, retrying while the
    /// input is not yet readable
    async fn trim(&self, request: &TrimRequest) -> Result<(), CaptureError>;

    /// Kill every child this driver still has running (shutdown path)
    fn kill_all(&self);
}
