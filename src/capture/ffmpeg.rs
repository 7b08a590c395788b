//! ffmpeg capture driver
//!
//! One ffmpeg child per camera writes the working file. ffmpeg stops cleanly
//! when it reads `q` on stdin, which lets it finish the container; anything
//! that ignores that is killed with its whole process group.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

use super::process;
use super::{CaptureDriver, CaptureError, CaptureHandle, CaptureProcess, ExitInfo, TrimRequest};
use crate::config::{CameraConfig, InputSpec, RecordingConfig};

/// Token ffmpeg treats as "finish the file and quit"
const STOP_TOKEN: &[u8] = b"q";

/// Knobs for the ffmpeg driver
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub ffmpeg_path: PathBuf,
    pub stdin_close_delay: Duration,
    pub trim_attempts: u32,
    pub trim_retry_backoff: Duration,
    /// Upper bound for a single trim run
    pub trim_timeout: Duration,
}

impl FfmpegSettings {
    pub fn from_config(recording: &RecordingConfig) -> Self {
        Self {
            ffmpeg_path: recording.ffmpeg_path.clone(),
            stdin_close_delay: recording.stdin_close_delay(),
            trim_attempts: recording.trim_attempts.max(1),
            trim_retry_backoff: recording.trim_retry_backoff(),
            trim_timeout: Duration::from_secs(300),
        }
    }
}

/// Capture driver backed by the ffmpeg command line
#[derive(Debug, Clone)]
pub struct FfmpegDriver {
    settings: FfmpegSettings,
}

impl FfmpegDriver {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    /// Run `ffmpeg -version` and return its first line
    pub async fn check_installed(&self) -> Result<String, CaptureError> {
        let output = Command::new(&self.settings.ffmpeg_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                CaptureError::Unavailable(format!("{:?}: {}", self.settings.ffmpeg_path, e))
            })?;

        if !output.status.success() {
            return Err(CaptureError::Unavailable(format!(
                "{:?} -version exited with {}",
                self.settings.ffmpeg_path, output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.lines().next().unwrap_or_default().to_string())
    }

    /// Arguments for a capture child
    fn capture_args(camera: &CameraConfig, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostats", "-y"]
            .iter()
            .map(OsString::from)
            .collect();

        match &camera.input {
            InputSpec::Device(input) => {
                args.extend(input.iter().map(OsString::from));
                args.extend(camera.hints.output_args.iter().map(OsString::from));
            }
            InputSpec::Multicast(url) => {
                args.extend(["-fflags", "+genpts", "-i"].iter().map(OsString::from));
                args.push(OsString::from(url));
                if camera.hints.output_args.is_empty() {
                    args.extend(["-c", "copy"].iter().map(OsString::from));
                } else {
                    args.extend(camera.hints.output_args.iter().map(OsString::from));
                }
            }
        }

        args.push(output.as_os_str().to_os_string());
        args
    }

    /// Arguments for a trim run writing to `output`
    fn trim_args(request: &TrimRequest, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-nostats", "-y"]
            .iter()
            .map(OsString::from)
            .collect();

        if request.start_offset_ms > 0 {
            args.push(OsString::from("-ss"));
            args.push(OsString::from(format_seconds(request.start_offset_ms)));
        }

        args.push(OsString::from("-i"));
        args.push(request.input.as_os_str().to_os_string());

        let codec: &[&str] = if request.recode {
            &[
                "-c:v", "libx264", "-preset", "veryfast", "-pix_fmt", "yuv420p", "-c:a", "aac",
            ]
        } else {
            &["-c", "copy"]
        };
        args.extend(codec.iter().map(OsString::from));
        // the output name does not end in .mp4 until it is complete
        args.extend(["-movflags", "+faststart", "-f", "mp4"].iter().map(OsString::from));

        args.push(output.as_os_str().to_os_string());
        args
    }

    /// Run one trim attempt. The clip only appears under its final name
    /// once ffmpeg has succeeded.
    async fn trim_once(&self, request: &TrimRequest) -> Result<(), String> {
        match tokio::fs::metadata(&request.input).await {
            Ok(meta) if meta.len() > 0 => {}
            Ok(_) => return Err(format!("{:?} is still empty", request.input)),
            Err(e) => return Err(format!("{:?} is not readable: {}", request.input, e)),
        }

        let partial = partial_path(&request.output);
        let published = match self.run_trim(request, &partial).await {
            Ok(()) => tokio::fs::rename(&partial, &request.output)
                .await
                .map_err(|e| format!("could not publish {:?}: {}", request.output, e)),
            Err(e) => Err(e),
        };
        if published.is_err() {
            remove_partial(&partial).await;
        }
        published
    }

    async fn run_trim(&self, request: &TrimRequest, output: &Path) -> Result<(), String> {
        let mut cmd = Command::new(&self.settings.ffmpeg_path);
        cmd.args(Self::trim_args(request, output))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        process::prepare(&mut cmd);

        let child = cmd.spawn().map_err(|e| format!("could not run ffmpeg: {}", e))?;
        let pid = process::adopt(&child).map_err(|e| format!("could not adopt ffmpeg: {}", e))?;

        let result = tokio::time::timeout(self.settings.trim_timeout, child.wait_with_output()).await;
        if let Some(pid) = pid {
            if result.is_err() {
                process::kill_tree(pid);
            }
            process::release(pid);
        }

        match result {
            Err(_) => Err(format!("timed out after {:?}", self.settings.trim_timeout)),
            Ok(Err(e)) => Err(format!("ffmpeg failed: {}", e)),
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(format!(
                    "ffmpeg exited with {}: {}",
                    output.status,
                    stderr.lines().last().unwrap_or_default()
                ))
            }
        }
    }
}

/// Where a clip is written while ffmpeg is still working on it
fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.file_name().map(OsString::from).unwrap_or_default();
    name.push(".partial");
    output.with_file_name(name)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed incomplete clip {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not remove incomplete clip {:?}: {}", path, e),
    }
}

/// `1234` ms -> `1.234`
fn format_seconds(ms: i64) -> String {
    format!("{}.{:03}", ms / 1000, ms % 1000)
}

/// Forward a capture child's stderr to the log
fn spawn_stderr_logger(camera: u32, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[Camera{}] ffmpeg: {}", camera, line);
        }
    });
}

#[async_trait]
impl CaptureDriver for FfmpegDriver {
    async fn start(
        &self,
        camera: &CameraConfig,
        output: &Path,
    ) -> Result<CaptureHandle, CaptureError> {
        let parent = output
            .parent()
            .ok_or_else(|| CaptureError::BadInput(format!("{:?} has no parent directory", output)))?;
        tokio::fs::create_dir_all(parent).await?;

        let mut cmd = Command::new(&self.settings.ffmpeg_path);
        cmd.args(Self::capture_args(camera, output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        process::prepare(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                CaptureError::Unavailable(format!("{:?}: {}", self.settings.ffmpeg_path, e))
            }
            _ => CaptureError::Io(e),
        })?;

        let pid = match process::adopt(&child) {
            Ok(pid) => pid,
            Err(e) => {
                let _ = child.start_kill();
                return Err(CaptureError::Io(e));
            }
        };

        if let Ok(Some(status)) = child.try_wait() {
            if let Some(pid) = pid {
                process::release(pid);
            }
            return Err(CaptureError::BadInput(format!(
                "Camera{} capture exited immediately with {}",
                camera.index, status
            )));
        }

        let stdin = child.stdin.take();
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(camera.index, stderr);
        }

        info!(
            "Camera{} capture started (pid {:?}) -> {:?}",
            camera.index, pid, output
        );

        Ok(CaptureHandle::new(
            camera,
            output.to_path_buf(),
            Some(CaptureProcess { child, stdin, pid }),
        ))
    }

    async fn request_stop(&self, handle: &mut CaptureHandle) -> Result<(), CaptureError> {
        let camera = handle.camera;
        let process = handle.process_mut().ok_or(CaptureError::Gone)?;
        let Some(mut stdin) = process.stdin.take() else {
            debug!("Camera{} stop already requested", camera);
            return Ok(());
        };

        let written = async {
            stdin.write_all(STOP_TOKEN).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!("Camera{} stop token not delivered: {}", camera, e);
            return Err(CaptureError::Gone);
        }

        tokio::time::sleep(self.settings.stdin_close_delay).await;
        drop(stdin);
        Ok(())
    }

    async fn wait(
        &self,
        handle: &mut CaptureHandle,
        deadline: Duration,
    ) -> Result<ExitInfo, CaptureError> {
        let camera = handle.camera;
        let process = handle.process_mut().ok_or(CaptureError::Gone)?;

        let status = match tokio::time::timeout(deadline, process.child.wait()).await {
            Ok(status) => status?,
            Err(_) => return Err(CaptureError::Timeout(deadline)),
        };
        handle.take_process();

        debug!("Camera{} capture exited with {}", camera, status);
        Ok(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }

    fn exited(&self, handle: &mut CaptureHandle) -> Option<ExitInfo> {
        let camera = handle.camera;
        let process = handle.process_mut()?;
        let status = match process.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                debug!("Camera{} try_wait: {}", camera, e);
                return None;
            }
        };
        handle.take_process();

        warn!("Camera{} capture exited on its own with {}", camera, status);
        Some(ExitInfo {
            code: status.code(),
            success: status.success(),
        })
    }

    fn force_kill(&self, handle: &mut CaptureHandle) {
        let camera = handle.camera;
        let Some(process) = handle.process_mut() else {
            return;
        };

        warn!("Killing Camera{} capture (pid {:?})", camera, process.pid);
        if let Some(pid) = process.pid {
            process::kill_tree(pid);
        }
        if let Err(e) = process.child.start_kill() {
            debug!("Camera{} start_kill: {}", camera, e);
        }
    }

    async fn trim(&self, request: &TrimRequest) -> Result<(), CaptureError> {
        let attempts = self.settings.trim_attempts.max(1);
        let mut reason = String::new();

        for attempt in 1..=attempts {
            match self.trim_once(request).await {
                Ok(()) => {
                    info!(
                        "Camera{} trimmed from {} ms -> {:?}",
                        request.camera, request.start_offset_ms, request.output
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "Camera{} trim attempt {}/{} failed: {}",
                        request.camera, attempt, attempts, e
                    );
                    reason = e;
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.settings.trim_retry_backoff).await;
            }
        }

        Err(CaptureError::TrimFailed { attempts, reason })
    }

    fn kill_all(&self) {
        process::kill_registered();
    }
}
