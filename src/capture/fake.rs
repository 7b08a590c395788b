//! In-process capture driver that records what it was asked to do

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use super::{CaptureDriver, CaptureError, CaptureHandle, ExitInfo, TrimRequest};
use crate::config::{CameraConfig, ContainerHints, InputSpec};

#[derive(Default)]
pub struct FakeDriver {
    pub fail_start: Option<u32>,
    pub fail_trim: Option<u32>,
    pub trim_delay: Duration,
    pub(crate) log: Mutex<Vec<String>>,
    pub(crate) trims: Mutex<Vec<TrimRequest>>,
    pub(crate) alive: Mutex<HashSet<u32>>,
}

impl FakeDriver {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn trims(&self) -> Vec<TrimRequest> {
        self.trims.lock().unwrap().clone()
    }

    pub fn alive(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    /// Make a camera's capture die as if its device went away
    pub fn lose(&self, camera: u32) {
        self.alive.lock().unwrap().remove(&camera);
    }
}

pub fn camera(index: u32) -> CameraConfig {
    CameraConfig {
        index,
        input: InputSpec::Device(vec!["-i".to_string(), format!("/dev/video{}", index)]),
        hints: ContainerHints {
            container: "mkv".to_string(),
            output_args: Vec::new(),
        },
        recode_on_finalize: false,
    }
}

#[async_trait]
impl CaptureDriver for FakeDriver {
    async fn start(
        &self,
        camera: &CameraConfig,
        output: &Path,
    ) -> Result<CaptureHandle, CaptureError> {
        if self.fail_start == Some(camera.index) {
            return Err(CaptureError::Unavailable("no such device".to_string()));
        }
        std::fs::write(output, b"frames")?;
        self.alive.lock().unwrap().insert(camera.index);
        self.record(format!("start Camera{}", camera.index));
        Ok(CaptureHandle::new(camera, output.to_path_buf(), None))
    }

    async fn request_stop(&self, handle: &mut CaptureHandle) -> Result<(), CaptureError> {
        self.record(format!("stop Camera{}", handle.camera));
        Ok(())
    }

    async fn wait(
        &self,
        handle: &mut CaptureHandle,
        _deadline: Duration,
    ) -> Result<ExitInfo, CaptureError> {
        if self.alive.lock().unwrap().remove(&handle.camera) {
            Ok(ExitInfo {
                code: Some(0),
                success: true,
            })
        } else {
            Err(CaptureError::Gone)
        }
    }

    fn exited(&self, handle: &mut CaptureHandle) -> Option<ExitInfo> {
        if self.alive.lock().unwrap().contains(&handle.camera) {
            return None;
        }
        Some(ExitInfo {
            code: Some(1),
            success: false,
        })
    }

    fn force_kill(&self, handle: &mut CaptureHandle) {
        self.record(format!("kill Camera{}", handle.camera));
        self.alive.lock().unwrap().remove(&handle.camera);
    }

    async fn trim(&self, request: &TrimRequest) -> Result<(), CaptureError> {
        self.trims.lock().unwrap().push(request.clone());
        if !self.trim_delay.is_zero() {
            tokio::time::sleep(self.trim_delay).await;
        }
        if self.fail_trim == Some(request.camera) {
            return Err(CaptureError::TrimFailed {
                attempts: 5,
                reason: "input unreadable".to_string(),
            });
        }
        std::fs::copy(&request.input, &request.output)?;
        Ok(())
    }

    fn kill_all(&self) {
        self.alive.lock().unwrap().clear();
    }
}
