//! Event router
//!
//! The broker and the HTTP callbacks are two skins over the same four
//! events. Each source decodes into an [`Event`]; the router stamps it with
//! the local clock and hands it to the supervisor.

mod broker;
mod forms;

pub use broker::{run_line_feed, BrokerTopics};
pub use forms::{DecisionForm, TimerForm};

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attempt::{AttemptId, LiftType};
use crate::clock::Clock;
use crate::supervisor::{SupervisorError, SupervisorHandle};

/// A payload that cannot be turned into an event
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
}

/// The four logical events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start(AttemptId),
    Stop,
    Decision,
    SessionEnd,
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error(transparent)]
    Malformed(#[from] EventError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Build an attempt identity out of loosely typed fields
pub(crate) fn attempt_from_fields(
    athlete: &str,
    attempt: &str,
    lift: &str,
    session: &str,
) -> Result<AttemptId, EventError> {
    let number: u8 = attempt
        .trim()
        .parse()
        .map_err(|_| EventError::InvalidField {
            field: "attemptNumber",
            reason: format!("'{}' is not a number", attempt),
        })?;
    if number == 0 || number > AttemptId::MAX_ATTEMPT {
        return Err(EventError::InvalidField {
            field: "attemptNumber",
            reason: format!("{} is not in 1..={}", number, AttemptId::MAX_ATTEMPT),
        });
    }

    let lift_type: LiftType = lift.parse().map_err(|reason| EventError::InvalidField {
        field: "liftType",
        reason,
    })?;

    AttemptId::new(athlete, lift_type, number, session).map_err(|reason| {
        EventError::InvalidField {
            field: "athlete",
            reason,
        }
    })
}

/// Translates decoded events into supervisor calls
#[derive(Clone)]
pub struct EventRouter {
    supervisor: SupervisorHandle,
    clock: Arc<dyn Clock>,
    broker: Arc<BrokerTopics>,
}

impl EventRouter {
    pub fn new(supervisor: SupervisorHandle, clock: Arc<dyn Clock>, broker: BrokerTopics) -> Self {
        Self {
            supervisor,
            clock,
            broker: Arc::new(broker),
        }
    }

    pub fn broker(&self) -> &BrokerTopics {
        &self.broker
    }

    /// Deliver one event, stamped with the local clock
    pub async fn dispatch(&self, event: Event) -> Result<(), SupervisorError> {
        let now = self.clock.now_ms();
        match event {
            Event::Start(attempt) => {
                info!("START {} at {}", attempt.describe(), now);
                self.supervisor.start(attempt, now).await
            }
            Event::Stop => {
                debug!("STOP at {}", now);
                self.supervisor.stop_tick(now).await
            }
            Event::Decision => {
                debug!("DECISION at {}", now);
                self.supervisor.decision(now).await
            }
            Event::SessionEnd => {
                info!("SESSION_END");
                self.supervisor.end_session().await
            }
        }
    }

    /// `POST /timer`
    pub async fn timer(&self, form: TimerForm) -> Result<(), RouteError> {
        if let Some(event) = form.into_event()? {
            self.dispatch(event).await?;
        }
        Ok(())
    }

    /// `POST /decision`
    pub async fn decision(&self, form: DecisionForm) -> Result<(), RouteError> {
        if let Some(event) = form.into_event()? {
            self.dispatch(event).await?;
        }
        Ok(())
    }

    /// One broker message; malformed ones are logged and dropped
    pub async fn broker_message(&self, topic: &str, payload: &[u8]) {
        match self.broker.decode(topic, payload) {
            Ok(Some(event)) => {
                if let Err(e) = self.dispatch(event).await {
                    warn!("Broker event on {} failed: {}", topic, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring broker message on {}: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fake::{camera, FakeDriver};
    use crate::clock::ManualClock;
    use crate::config::BrokerConfig;
    use crate::status::{StatusBus, StatusCode};
    use crate::supervisor::{Phase, Supervisor, SupervisorSettings};
    use std::time::Duration;

    fn router() -> (EventRouter, StatusBus, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = SupervisorSettings {
            video_dir: dir.path().join("videos"),
            working_dir: dir.path().join("work"),
            trim_lead_ms: 5_000,
            decision_delay: Duration::from_secs(2),
            stop_grace: Duration::from_secs(2),
        };
        let bus = StatusBus::new(32);
        let clock = Arc::new(ManualClock::new(1_000));
        let (supervisor, handle) = Supervisor::new(
            settings,
            vec![camera(1)],
            Arc::new(FakeDriver::default()),
            clock.clone(),
            bus.clone(),
        );
        tokio::spawn(supervisor.run());

        let broker = BrokerTopics::new(&BrokerConfig {
            topic_root: "owlcms/fop".to_string(),
            platform: "A".to_string(),
        });
        (EventRouter::new(handle, clock, broker), bus, dir)
    }

    fn start_form() -> TimerForm {
        TimerForm {
            athlete_timer_event_type: Some("StartTime".to_string()),
            full_name: Some("Alice Li".to_string()),
            attempt_number: Some("1".to_string()),
            lift_type_key: Some("SNATCH".to_string()),
            group: Some("Senior Women 64kg".to_string()),
            session: None,
        }
    }

    fn decision_form(event: &str) -> DecisionForm {
        DecisionForm {
            fop_state: Some("DECISION_VISIBLE".to_string()),
            decision_event_type: Some(event.to_string()),
            full_name: Some("Alice Li".to_string()),
            attempt_number: Some("1".to_string()),
            lift_type_key: Some("SNATCH".to_string()),
        }
    }

    #[test]
    fn test_attempt_from_fields() {
        let id = attempt_from_fields("Alice Li", " 2 ", "CLEANJERK", "G1").unwrap();
        assert_eq!(id.attempt, 2);
        assert_eq!(id.lift_type, LiftType::CleanJerk);

        assert!(matches!(
            attempt_from_fields("Alice", "x", "SNATCH", ""),
            Err(EventError::InvalidField { field: "attemptNumber", .. })
        ));
        assert!(matches!(
            attempt_from_fields("Alice", "4", "SNATCH", ""),
            Err(EventError::InvalidField { field: "attemptNumber", .. })
        ));
        assert!(matches!(
            attempt_from_fields("Alice", "1", "BENCH", ""),
            Err(EventError::InvalidField { field: "liftType", .. })
        ));
        assert!(matches!(
            attempt_from_fields("  ", "1", "SNATCH", ""),
            Err(EventError::InvalidField { field: "athlete", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_decision_keeps_capturing() {
        let (router, bus, _dir) = router();
        let mut ui = bus.subscribe_ui();
        let view = router.supervisor.watch();

        router.timer(start_form()).await.unwrap();
        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Recording);

        router.decision(decision_form("RESET")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(view.borrow().phase, Phase::Capturing);
        assert!(!view.borrow().finalize_pending);
        assert!(ui.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_visible_decision_finalizes() {
        let (router, bus, _dir) = router();
        let mut ui = bus.subscribe_ui();

        router.timer(start_form()).await.unwrap();
        let mut stop = start_form();
        stop.athlete_timer_event_type = Some("StopTime".to_string());
        router.timer(stop).await.unwrap();
        router.decision(decision_form("FULL_DECISION")).await.unwrap();

        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Recording);
        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Trimming);
        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_messages_drive_the_supervisor() {
        let (router, bus, _dir) = router();
        let mut ui = bus.subscribe_ui();

        router
            .broker_message(
                "owlcms/fop/start/A",
                br#"{"athleteName":"Bob Stone","attemptNumber":3,"liftType":"CLEANJERK","session":"M1"} 1712345678901"#,
            )
            .await;
        let recording = ui.recv().await.unwrap();
        assert_eq!(recording.text, "Bob Stone - Clean & Jerk attempt 3");
        assert_eq!(recording.session, "M1");

        // other platforms and malformed payloads are dropped
        router.broker_message("owlcms/fop/refereesDecision/B", b"").await;
        router.broker_message("owlcms/fop/start/A", b"{not json} 1").await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(ui.try_recv().is_err());

        router.broker_message("owlcms/fop/refereesDecision/A", b"").await;
        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Trimming);
        assert_eq!(ui.recv().await.unwrap().code, StatusCode::Ready);

        router.broker_message("owlcms/fop/break", b"GROUP_DONE").await;
        let ended = ui.recv().await.unwrap();
        assert_eq!(ended.text, crate::status::NO_ACTIVE_SESSION);
    }

    #[tokio::test]
    async fn test_malformed_start_form_is_rejected() {
        let (router, _bus, _dir) = router();
        let mut form = start_form();
        form.full_name = None;

        let err = router.timer(form).await.unwrap_err();
        assert!(matches!(
            err,
            RouteError::Malformed(EventError::MissingField("fullName"))
        ));
    }
}
