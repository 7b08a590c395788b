//! Finalize job: stop every capture, then publish one clip per camera

use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::attempt::{final_clip_name, session_dir_name, AttemptId, AttemptSnapshot};
use crate::capture::{CaptureDriver, CaptureError, CaptureHandle, TrimRequest};

use super::SupervisorSettings;

/// A clip that reached the published tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipRecord {
    pub camera: u32,
    pub path: PathBuf,
    pub attempt: AttemptId,
}

/// Outcome of one finalize
#[derive(Debug, Default)]
pub struct FinalizeReport {
    pub clips: Vec<ClipRecord>,
    /// Cameras whose working file was kept because publishing failed
    pub failed: Vec<(u32, String)>,
}

impl FinalizeReport {
    pub fn status_text(&self) -> String {
        let total = self.clips.len() + self.failed.len();
        if self.failed.is_empty() {
            crate::status::VIDEOS_READY.to_string()
        } else {
            let cameras: Vec<String> = self
                .failed
                .iter()
                .map(|(camera, _)| format!("Camera{}", camera))
                .collect();
            format!(
                "{} ({} of {} failed: {})",
                crate::status::VIDEOS_READY,
                self.failed.len(),
                total,
                cameras.join(", ")
            )
        }
    }
}

pub(super) struct FinalizeJob {
    pub driver: Arc<dyn CaptureDriver>,
    pub settings: Arc<SupervisorSettings>,
    pub snapshot: AttemptSnapshot,
    pub session: String,
    pub wall_ms: i64,
    pub handles: Vec<CaptureHandle>,
}

impl FinalizeJob {
    pub async fn run(self) -> FinalizeReport {
        let FinalizeJob {
            driver,
            settings,
            snapshot,
            session,
            wall_ms,
            mut handles,
        } = self;

        join_all(
            handles
                .iter_mut()
                .map(|handle| stop_capture(driver.as_ref(), handle, &settings)),
        )
        .await;

        let Some(attempt) = snapshot.id.clone() else {
            error!("Finalize without an attempt identity, keeping working files");
            return FinalizeReport {
                clips: Vec::new(),
                failed: handles
                    .iter()
                    .map(|h| (h.camera, "no attempt identity".to_string()))
                    .collect(),
            };
        };

        let session_dir = settings.video_dir.join(session_dir_name(&session));
        if let Err(e) = tokio::fs::create_dir_all(&session_dir).await {
            error!("Failed to create {}: {}", session_dir.display(), e);
            return FinalizeReport {
                clips: Vec::new(),
                failed: handles.iter().map(|h| (h.camera, e.to_string())).collect(),
            };
        }

        let offset = snapshot.trim_offset_ms(settings.trim_lead_ms);
        match offset {
            Some(ms) => info!("Trimming {} at {}ms", attempt.describe(), ms),
            None => info!("No start anchor for {}, publishing untrimmed", attempt.describe()),
        }

        let results = join_all(handles.iter().map(|handle| {
            let output = session_dir.join(final_clip_name(&attempt, handle.camera, wall_ms));
            publish_clip(driver.as_ref(), handle, output, offset)
        }))
        .await;

        let mut report = FinalizeReport::default();
        for (handle, result) in handles.iter().zip(results) {
            match result {
                Ok(path) => report.clips.push(ClipRecord {
                    camera: handle.camera,
                    path,
                    attempt: attempt.clone(),
                }),
                Err(e) => {
                    error!(
                        "Camera{} clip not published, keeping {}: {}",
                        handle.camera,
                        handle.working_path.display(),
                        e
                    );
                    report.failed.push((handle.camera, e.to_string()));
                }
            }
        }
        report
    }
}

/// Ask the child to stop; kill it if it does not exit within the grace period
async fn stop_capture(
    driver: &dyn CaptureDriver,
    handle: &mut CaptureHandle,
    settings: &SupervisorSettings,
) {
    if let Err(e) = driver.request_stop(handle).await {
        debug!("Camera{} stop request: {}", handle.camera, e);
    }

    match driver.wait(handle, settings.stop_grace).await {
        Ok(exit) => debug!("Camera{} capture exited: {:?}", handle.camera, exit),
        Err(CaptureError::Gone) => {}
        Err(e) => {
            warn!(
                "Camera{} did not stop within {:?} ({}), killing it",
                handle.camera, settings.stop_grace, e
            );
            driver.force_kill(handle);
            if let Err(e) = driver.wait(handle, settings.stop_grace).await {
                debug!("Camera{} reap after kill: {}", handle.camera, e);
            }
        }
    }
}

/// Produce the published clip; the working file is removed only on success
async fn publish_clip(
    driver: &dyn CaptureDriver,
    handle: &CaptureHandle,
    output: PathBuf,
    offset: Option<i64>,
) -> Result<PathBuf, CaptureError> {
    match offset {
        None => move_file(&handle.working_path, &output).await?,
        Some(start_offset_ms) => {
            driver
                .trim(&TrimRequest {
                    camera: handle.camera,
                    input: handle.working_path.clone(),
                    output: output.clone(),
                    start_offset_ms,
                    recode: handle.recode_on_finalize,
                })
                .await?;
            remove_working_file(&handle.working_path).await;
        }
    }
    info!("Camera{} published {}", handle.camera, output.display());
    Ok(output)
}

async fn move_file(from: &Path, to: &Path) -> Result<(), CaptureError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    // working dir may sit on another filesystem
    if let Err(e) = tokio::fs::copy(from, to).await {
        remove_working_file(to).await;
        return Err(e.into());
    }
    remove_working_file(from).await;
    Ok(())
}

pub(super) async fn remove_working_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
