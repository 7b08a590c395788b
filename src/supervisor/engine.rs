//! Supervisor engine loop
//!
//! Single owner of the attempt state and the capture handles. Commands,
//! the decision debounce timer, capture health checks and finalize
//! completions all arrive at the same `select!`, so transitions never
//! interleave.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::attempt::{working_file_name, AttemptId, AttemptState};
use crate::capture::{CaptureDriver, CaptureError, CaptureHandle, ExitInfo};
use crate::clock::Clock;
use crate::config::{CameraConfig, RecordingConfig};
use crate::status::{StatusBus, StatusMessage, NO_ACTIVE_SESSION};

use super::finalize::{remove_working_file, FinalizeJob};
use super::{
    create_supervisor_channels, FinalizeReport, Phase, SupervisorCommand, SupervisorError,
    SupervisorHandle, SupervisorView,
};

/// How often running captures are checked for an early exit
const CAPTURE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Timing and layout the supervisor works with
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub video_dir: PathBuf,
    pub working_dir: PathBuf,
    /// Preparation kept before the clock stopped
    pub trim_lead_ms: i64,
    /// Quiet period after the last decision before finalizing
    pub decision_delay: Duration,
    /// How long a capture gets to exit after the stop token
    pub stop_grace: Duration,
}

impl SupervisorSettings {
    pub fn from_config(recording: &RecordingConfig) -> Self {
        Self {
            video_dir: recording.video_dir.clone(),
            working_dir: recording.working_dir(),
            trim_lead_ms: recording.trim_lead_ms as i64,
            decision_delay: recording.decision_delay(),
            stop_grace: recording.stop_grace(),
        }
    }
}

/// The attempt lifecycle engine
pub struct Supervisor {
    settings: Arc<SupervisorSettings>,
    cameras: Vec<CameraConfig>,
    driver: Arc<dyn CaptureDriver>,
    clock: Arc<dyn Clock>,
    bus: StatusBus,
    cmd_rx: mpsc::Receiver<SupervisorCommand>,
    view_tx: watch::Sender<SupervisorView>,
    done_tx: mpsc::Sender<FinalizeReport>,
    done_rx: mpsc::Receiver<FinalizeReport>,
    phase: Phase,
    attempt: AttemptState,
    handles: Vec<CaptureHandle>,
    /// Session of the last attempt that named one
    session: String,
    /// Debounced finalize deadline, pushed back by every decision
    finalize_at: Option<Instant>,
    finalize_job: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        cameras: Vec<CameraConfig>,
        driver: Arc<dyn CaptureDriver>,
        clock: Arc<dyn Clock>,
        bus: StatusBus,
    ) -> (Self, SupervisorHandle) {
        let (handle, cmd_rx, view_tx) = create_supervisor_channels();
        let (done_tx, done_rx) = mpsc::channel(1);

        let supervisor = Self {
            settings: Arc::new(settings),
            cameras,
            driver,
            clock,
            bus,
            cmd_rx,
            view_tx,
            done_tx,
            done_rx,
            phase: Phase::Idle,
            attempt: AttemptState::new(),
            handles: Vec::new(),
            session: String::new(),
            finalize_at: None,
            finalize_job: None,
        };
        (supervisor, handle)
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Supervisor started ({} cameras, videos in {})",
            self.cameras.len(),
            self.settings.video_dir.display()
        );

        let mut capture_check = tokio::time::interval(CAPTURE_CHECK_INTERVAL);
        capture_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let finalize_at = self.finalize_at;
            let capturing = self.phase == Phase::Capturing;

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            info!("All supervisor handles dropped, shutting down");
                            self.shutdown().await;
                            break;
                        }
                    }
                }

                Some(report) = self.done_rx.recv() => {
                    self.complete_finalize(report);
                }

                _ = capture_check.tick(), if capturing => {
                    self.check_captures().await;
                }

                _ = async {
                    match finalize_at {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.finalize_at = None;
                    let now = self.clock.now_ms();
                    if let Err(e) = self.begin_finalize(now) {
                        debug!("Debounced finalize skipped: {}", e);
                    }
                }
            }
        }

        info!("Supervisor stopped");
    }

    /// Returns false when the engine should stop
    async fn handle_command(&mut self, cmd: SupervisorCommand) -> bool {
        match cmd {
            SupervisorCommand::Start {
                attempt,
                at_ms,
                reply,
            } => {
                let result = self.start(attempt, at_ms).await;
                let _ = reply.send(result);
            }
            SupervisorCommand::StopTick { at_ms } => self.stop_tick(at_ms),
            SupervisorCommand::Decision { at_ms } => self.decision(at_ms),
            #[cfg(test)]
            SupervisorCommand::Finalize { at_ms, reply } => {
                let result = self.begin_finalize(at_ms);
                if let Err(e) = &result {
                    debug!("Finalize rejected: {}", e);
                }
                let _ = reply.send(result);
            }
            SupervisorCommand::EndSession => self.end_session(),
            SupervisorCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn start(&mut self, mut attempt: AttemptId, at_ms: i64) -> Result<(), SupervisorError> {
        match self.phase {
            Phase::Finalizing => {
                warn!("Start for {} rejected, finalize in progress", attempt.describe());
                return Err(SupervisorError::Busy);
            }
            Phase::Capturing => {
                info!(
                    "Re-arming: discarding {} for {}",
                    self.attempt
                        .id()
                        .map(AttemptId::describe)
                        .unwrap_or_default(),
                    attempt.describe()
                );
                self.finalize_at = None;
                let handles = std::mem::take(&mut self.handles);
                self.discard(handles).await;
                self.attempt.reset();
            }
            Phase::Idle | Phase::Aborted => {}
        }

        if attempt.session.is_empty() {
            attempt.session = self.session.clone();
        } else {
            self.session = attempt.session.clone();
        }

        if let Err(e) = tokio::fs::create_dir_all(&self.settings.working_dir).await {
            let camera = self.cameras.first().map(|c| c.index).unwrap_or(1);
            return Err(self.fail_start(Vec::new(), camera, CaptureError::Io(e), &attempt).await);
        }

        let cameras = self.cameras.clone();
        let mut handles = Vec::with_capacity(cameras.len());
        for camera in &cameras {
            let path = self.settings.working_dir.join(working_file_name(
                &attempt,
                camera.index,
                at_ms,
                &camera.hints.container,
            ));
            match self.driver.start(camera, &path).await {
                Ok(handle) => {
                    debug!("Camera{} capturing to {}", camera.index, path.display());
                    handles.push(handle);
                }
                Err(e) => {
                    let index = camera.index;
                    return Err(self.fail_start(handles, index, e, &attempt).await);
                }
            }
        }

        info!("Recording {}", attempt.describe());
        self.handles = handles;
        self.attempt.on_start(attempt.clone(), at_ms);
        self.phase = Phase::Capturing;
        self.publish_view();
        self.bus
            .publish(StatusMessage::recording(attempt.describe(), attempt.session.clone()));
        Ok(())
    }

    /// Tear down whatever started and report the failing camera
    async fn fail_start(
        &mut self,
        started: Vec<CaptureHandle>,
        camera: u32,
        source: CaptureError,
        attempt: &AttemptId,
    ) -> SupervisorError {
        error!("Camera{} could not start for {}: {}", camera, attempt.describe(), source);
        self.discard(started).await;
        self.attempt.reset();
        self.phase = Phase::Idle;
        self.publish_view();

        let err = SupervisorError::StartPartial { camera, source };
        self.bus
            .publish(StatusMessage::error(err.to_string(), attempt.session.clone()));
        err
    }

    fn stop_tick(&mut self, at_ms: i64) {
        if self.phase != Phase::Capturing {
            debug!("Clock stop ignored, no ongoing recording");
            return;
        }
        self.attempt.on_stop_tick(at_ms);
        debug!(
            "Clock stop #{} at {}",
            self.attempt.stop_request_count(),
            self.attempt.stop_at()
        );
    }

    fn decision(&mut self, at_ms: i64) {
        if self.phase != Phase::Capturing {
            debug!("Decision ignored, no ongoing recording");
            return;
        }
        self.attempt.on_decision(at_ms);
        self.finalize_at = Some(Instant::now() + self.settings.decision_delay);
        debug!("Finalize scheduled in {:?}", self.settings.decision_delay);
        self.publish_view();
    }

    fn begin_finalize(&mut self, at_ms: i64) -> Result<(), SupervisorError> {
        match self.phase {
            Phase::Capturing => {}
            Phase::Finalizing => return Err(SupervisorError::Busy),
            Phase::Idle | Phase::Aborted => {
                debug!("No ongoing recordings to stop");
                return Err(SupervisorError::NotCapturing);
            }
        }

        self.finalize_at = None;
        let snapshot = self.attempt.snapshot();
        let session = snapshot
            .id
            .as_ref()
            .map(|id| id.session.clone())
            .unwrap_or_default();
        let text = snapshot
            .id
            .as_ref()
            .map(AttemptId::describe)
            .unwrap_or_default();

        info!("Finalizing {}", text);
        self.phase = Phase::Finalizing;
        let job = FinalizeJob {
            driver: self.driver.clone(),
            settings: self.settings.clone(),
            snapshot,
            session: session.clone(),
            wall_ms: at_ms,
            handles: std::mem::take(&mut self.handles),
        };
        self.publish_view();
        self.bus.publish(StatusMessage::trimming(text, session));

        let done_tx = self.done_tx.clone();
        self.finalize_job = Some(tokio::spawn(async move {
            let report = job.run().await;
            let _ = done_tx.send(report).await;
        }));
        Ok(())
    }

    fn complete_finalize(&mut self, report: FinalizeReport) {
        self.finalize_job = None;
        let session = self
            .attempt
            .id()
            .map(|id| id.session.clone())
            .unwrap_or_default();

        info!(
            "Finalize done: {} published, {} failed",
            report.clips.len(),
            report.failed.len()
        );
        for clip in &report.clips {
            debug!(
                "Camera{} {} -> {}",
                clip.camera,
                clip.attempt.describe(),
                clip.path.display()
            );
        }
        for (camera, reason) in &report.failed {
            warn!("Camera{} not published: {}", camera, reason);
        }
        self.attempt.reset();
        self.phase = Phase::Idle;
        self.publish_view();
        self.bus
            .publish(StatusMessage::ready(report.status_text(), session));
    }

    /// Abort the attempt if one of its captures died under it
    async fn check_captures(&mut self) {
        let mut lost = None;
        for handle in &mut self.handles {
            if let Some(exit) = self.driver.exited(handle) {
                lost = Some((handle.camera, exit));
                break;
            }
        }

        if let Some((camera, exit)) = lost {
            let reason = format!("Camera{} stopped recording ({})", camera, describe_exit(&exit));
            self.abort(&reason).await;
        }
    }

    /// Drop the running attempt without publishing anything
    async fn abort(&mut self, reason: &str) {
        if self.phase != Phase::Capturing {
            return;
        }

        let session = self
            .attempt
            .id()
            .map(|id| id.session.clone())
            .unwrap_or_default();
        warn!("Aborting attempt: {}", reason);

        self.phase = Phase::Aborted;
        self.finalize_at = None;
        self.publish_view();

        let handles = std::mem::take(&mut self.handles);
        self.discard(handles).await;
        self.attempt.reset();
        self.phase = Phase::Idle;
        self.publish_view();
        self.bus.publish(StatusMessage::error(reason, session));
    }

    fn end_session(&mut self) {
        info!("Session '{}' ended", self.session);
        self.session.clear();
        self.publish_view();

        if self.phase == Phase::Idle {
            self.bus.publish(StatusMessage::ready(NO_ACTIVE_SESSION, ""));
        } else {
            debug!("Session ended during {:?}, status follows the attempt", self.phase);
        }
    }

    async fn shutdown(&mut self) {
        info!("Supervisor shutting down");
        self.finalize_at = None;

        if !self.handles.is_empty() {
            let handles = std::mem::take(&mut self.handles);
            self.discard(handles).await;
        }

        if let Some(mut job) = self.finalize_job.take() {
            self.driver.kill_all();
            if tokio::time::timeout(self.settings.stop_grace, &mut job)
                .await
                .is_err()
            {
                warn!("Finalize did not wind down, abandoning it");
                job.abort();
            }
        }

        self.driver.kill_all();
        self.attempt.reset();
        self.phase = Phase::Idle;
        self.session.clear();
        self.publish_view();

        self.bus.publish(StatusMessage::ready(NO_ACTIVE_SESSION, ""));
        self.bus.close();
    }

    /// Kill captures and remove their working files
    async fn discard(&self, handles: Vec<CaptureHandle>) {
        for mut handle in handles {
            self.driver.force_kill(&mut handle);
            if let Err(e) = self.driver.wait(&mut handle, self.settings.stop_grace).await {
                debug!("Camera{} reap: {}", handle.camera, e);
            }
            remove_working_file(&handle.working_path).await;
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(SupervisorView {
            phase: self.phase,
            session: self.session.clone(),
            attempt: self.attempt.id().cloned(),
            active_captures: self.handles.len(),
            finalize_pending: self.finalize_at.is_some(),
        });
    }
}

fn describe_exit(exit: &ExitInfo) -> String {
    match exit.code {
        Some(code) => format!("exit code {}", code),
        None => "killed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::LiftType;
    use crate::capture::fake::{camera, FakeDriver};
    use crate::clock::ManualClock;
    use crate::status::StatusCode;
    use std::path::Path;
    use tokio::sync::broadcast;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        handle: SupervisorHandle,
        driver: Arc<FakeDriver>,
        bus: StatusBus,
        ui: broadcast::Receiver<StatusMessage>,
        clock: Arc<ManualClock>,
        video_dir: PathBuf,
        working_dir: PathBuf,
        task: JoinHandle<()>,
        _dir: tempfile::TempDir,
    }

    fn harness(cameras: u32, driver: FakeDriver) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let video_dir = dir.path().join("videos");
        let working_dir = video_dir.join(".capture");
        let settings = SupervisorSettings {
            video_dir: video_dir.clone(),
            working_dir: working_dir.clone(),
            trim_lead_ms: 5_000,
            decision_delay: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
        };

        let bus = StatusBus::new(32);
        let ui = bus.subscribe_ui();
        let clock = Arc::new(ManualClock::new(1_000));
        let driver = Arc::new(driver);
        let (supervisor, handle) = Supervisor::new(
            settings,
            (1..=cameras).map(camera).collect(),
            driver.clone(),
            clock.clone(),
            bus.clone(),
        );
        let task = tokio::spawn(supervisor.run());

        Harness {
            handle,
            driver,
            bus,
            ui,
            clock,
            video_dir,
            working_dir,
            task,
            _dir: dir,
        }
    }

    fn attempt(name: &str, n: u8, session: &str) -> AttemptId {
        AttemptId::new(name, LiftType::Snatch, n, session).unwrap()
    }

    async fn next_status(ui: &mut broadcast::Receiver<StatusMessage>) -> StatusMessage {
        tokio::time::timeout(Duration::from_secs(60), ui.recv())
            .await
            .expect("status within 60s")
            .unwrap()
    }

    fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let Ok(entries) = std::fs::read_dir(dir) else {
            return found;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                found.extend(files_under(&path));
            } else {
                found.push(path);
            }
        }
        found
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_publishes_trimmed_clip() {
        let mut h = harness(1, FakeDriver::default());

        h.handle
            .start(attempt("Alice Li", 1, "Senior Women 64kg"), 1_000)
            .await
            .unwrap();
        let recording = next_status(&mut h.ui).await;
        assert_eq!(recording.code, StatusCode::Recording);
        assert_eq!(recording.text, "Alice Li - Snatch attempt 1");
        assert_eq!(recording.session, "Senior Women 64kg");

        h.handle.stop_tick(7_000).await.unwrap();
        h.handle.decision(10_000).await.unwrap();

        // nothing happens before the decision delay
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(matches!(h.ui.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.handle.view().phase, Phase::Capturing);

        h.clock.set(12_000);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);
        let ready = next_status(&mut h.ui).await;
        assert_eq!(ready.code, StatusCode::Ready);
        assert_eq!(ready.text, "Videos ready");

        let trims = h.driver.trims();
        assert_eq!(trims.len(), 1);
        assert_eq!(trims[0].start_offset_ms, 1_000);
        assert!(trims[0]
            .output
            .starts_with(h.video_dir.join("Senior_Women_64kg")));
        let name = trims[0].output.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_Alice_Li_SNATCH_attempt1_Camera1.mp4"), "{}", name);
        assert!(trims[0].output.exists());
        assert!(!trims[0].input.exists());

        assert_eq!(h.handle.view().phase, Phase::Idle);
        assert_eq!(h.driver.log(), vec!["start Camera1", "stop Camera1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_capturing_rearms() {
        let mut h = harness(1, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.start(attempt("Alice", 2, "A"), 5_000).await.unwrap();

        let first = next_status(&mut h.ui).await;
        let second = next_status(&mut h.ui).await;
        assert_eq!(first.text, "Alice - Snatch attempt 1");
        assert_eq!(second.code, StatusCode::Recording);
        assert_eq!(second.text, "Alice - Snatch attempt 2");

        assert!(h.driver.log().contains(&"kill Camera1".to_string()));
        let working = files_under(&h.working_dir);
        assert_eq!(working.len(), 1);
        assert!(working[0].to_string_lossy().contains("attempt2"));

        let view = h.handle.view();
        assert_eq!(view.phase, Phase::Capturing);
        assert_eq!(view.attempt.unwrap().attempt, 2);
        assert_eq!(view.active_captures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decision_without_start_is_ignored() {
        let mut h = harness(2, FakeDriver::default());

        h.handle.stop_tick(1_000).await.unwrap();
        h.handle.decision(2_000).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(matches!(h.ui.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.handle.view().phase, Phase::Idle);
        assert!(files_under(&h.video_dir).is_empty());
        assert!(h.driver.log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_stops_keep_first_anchor() {
        let mut h = harness(1, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.stop_tick(7_000).await.unwrap();
        h.handle.stop_tick(9_000).await.unwrap();
        h.handle.stop_tick(11_000).await.unwrap();
        h.handle.decision(12_000).await.unwrap();

        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Ready);
        assert_eq!(h.driver.trims()[0].start_offset_ms, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decisions_are_debounced() {
        let mut h = harness(2, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);

        h.handle.decision(10_000).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = Instant::now();
        h.handle.decision(11_000).await.unwrap();

        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);
        assert!(second.elapsed() >= Duration::from_secs(2));
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Ready);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(matches!(h.ui.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.driver.trims().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_camera_start_tears_down_the_rest() {
        let mut h = harness(
            2,
            FakeDriver {
                fail_start: Some(2),
                ..Default::default()
            },
        );

        let err = h
            .handle
            .start(attempt("Alice", 1, "A"), 1_000)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartPartial { camera: 2, .. }));

        let status = next_status(&mut h.ui).await;
        assert_eq!(status.code, StatusCode::Error);
        assert!(status.text.contains("Camera2 could not start"), "{}", status.text);

        assert_eq!(h.driver.log(), vec!["start Camera1", "kill Camera1"]);
        assert!(files_under(&h.working_dir).is_empty());
        assert_eq!(h.handle.view().phase, Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trim_keeps_working_file() {
        let mut h = harness(
            2,
            FakeDriver {
                fail_trim: Some(2),
                ..Default::default()
            },
        );

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.stop_tick(8_000).await.unwrap();
        h.handle.finalize(9_000).await.unwrap();

        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);
        let ready = next_status(&mut h.ui).await;
        assert_eq!(ready.code, StatusCode::Ready);
        assert_eq!(ready.text, "Videos ready (1 of 2 failed: Camera2)");

        for trim in h.driver.trims() {
            if trim.camera == 1 {
                assert!(trim.output.exists());
                assert!(!trim.input.exists());
            } else {
                assert!(!trim.output.exists());
                assert!(trim.input.exists());
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_during_finalize_is_busy() {
        let mut h = harness(
            1,
            FakeDriver {
                trim_delay: Duration::from_secs(10),
                ..Default::default()
            },
        );

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.finalize(2_000).await.unwrap();
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);

        let err = h
            .handle
            .start(attempt("Bob", 1, "A"), 3_000)
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));
        assert!(matches!(
            h.handle.finalize(3_000).await,
            Err(SupervisorError::Busy)
        ));

        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Ready);
        h.handle.start(attempt("Bob", 1, "A"), 20_000).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_finalize_when_idle_is_silent() {
        let mut h = harness(1, FakeDriver::default());

        let err = h.handle.finalize(1_000).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotCapturing));
        assert!(matches!(h.ui.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_start_anchor_publishes_untrimmed() {
        let mut h = harness(1, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "A"), 0).await.unwrap();
        h.handle.finalize(3_000).await.unwrap();
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Ready);

        assert!(h.driver.trims().is_empty());
        let published = files_under(&h.video_dir.join("A"));
        assert_eq!(published.len(), 1);
        assert!(published[0].to_string_lossy().ends_with("_Alice_SNATCH_attempt1_Camera1.mp4"));
        assert!(files_under(&h.working_dir).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_camera_aborts_and_leaves_nothing_behind() {
        let mut h = harness(2, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "Group A"), 1_000).await.unwrap();
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        h.driver.lose(2);

        let aborted = next_status(&mut h.ui).await;
        assert_eq!(aborted.code, StatusCode::Error);
        assert_eq!(aborted.text, "Camera2 stopped recording (exit code 1)");
        assert_eq!(aborted.session, "Group A");
        assert!(h.driver.log().contains(&"kill Camera1".to_string()));
        assert!(files_under(&h.video_dir).is_empty());
        assert_eq!(h.driver.alive(), 0);
        assert_eq!(h.handle.view().phase, Phase::Idle);

        // the session carries over to attempts that do not name one
        h.handle.start(attempt("Bob", 1, ""), 5_000).await.unwrap();
        let recording = next_status(&mut h.ui).await;
        assert_eq!(recording.session, "Group A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_session_when_idle() {
        let mut h = harness(1, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "Group A"), 1_000).await.unwrap();
        next_status(&mut h.ui).await;
        h.driver.lose(1);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Error);

        h.handle.end_session().await.unwrap();
        let ended = next_status(&mut h.ui).await;
        assert_eq!(ended.code, StatusCode::Ready);
        assert_eq!(ended.text, NO_ACTIVE_SESSION);
        assert_eq!(h.handle.view().session, "");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_capturing() {
        let mut h = harness(2, FakeDriver::default());

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.shutdown().await;

        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        let last = next_status(&mut h.ui).await;
        assert_eq!(last.code, StatusCode::Ready);
        assert_eq!(last.text, NO_ACTIVE_SESSION);

        assert!(h.bus.is_closed());
        assert_eq!(h.driver.alive(), 0);
        assert!(files_under(&h.working_dir).is_empty());
        h.task.await.unwrap();

        assert!(matches!(
            h.handle.start(attempt("Bob", 1, "A"), 2_000).await,
            Err(SupervisorError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_finalize() {
        let mut h = harness(
            1,
            FakeDriver {
                trim_delay: Duration::from_secs(60),
                ..Default::default()
            },
        );

        h.handle.start(attempt("Alice", 1, "A"), 1_000).await.unwrap();
        h.handle.finalize(2_000).await.unwrap();
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Recording);
        assert_eq!(next_status(&mut h.ui).await.code, StatusCode::Trimming);

        h.handle.shutdown().await;
        let last = next_status(&mut h.ui).await;
        assert_eq!(last.text, NO_ACTIVE_SESSION);
        assert!(h.bus.is_closed());
        h.task.await.unwrap();
    }
}
