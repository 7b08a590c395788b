//! Form bodies of the scoring server's HTTP callbacks

use serde::Deserialize;
use tracing::debug;

use super::{attempt_from_fields, Event, EventError};

/// Timer-state values that carry meaning for recording
const START_TIME: &str = "StartTime";
const STOP_TIME: &str = "StopTime";
const DECISION_VISIBLE: &str = "DECISION_VISIBLE";
const RESET: &str = "RESET";

/// `POST /timer`
///
/// Every field is optional at the serde level so a missing one becomes a
/// 400 with its name rather than a generic rejection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerForm {
    pub athlete_timer_event_type: Option<String>,
    pub full_name: Option<String>,
    pub attempt_number: Option<String>,
    pub lift_type_key: Option<String>,
    pub group: Option<String>,
    pub session: Option<String>,
}

/// `POST /decision`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionForm {
    pub fop_state: Option<String>,
    pub decision_event_type: Option<String>,
    pub full_name: Option<String>,
    pub attempt_number: Option<String>,
    pub lift_type_key: Option<String>,
}

fn required<'a>(field: &'static str, value: &'a Option<String>) -> Result<&'a str, EventError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(EventError::MissingField(field)),
    }
}

impl TimerForm {
    pub fn into_event(self) -> Result<Option<Event>, EventError> {
        let kind = required("athleteTimerEventType", &self.athlete_timer_event_type)?;
        let athlete = required("fullName", &self.full_name)?;
        let attempt = required("attemptNumber", &self.attempt_number)?;
        let lift = required("liftTypeKey", &self.lift_type_key)?;

        match kind {
            START_TIME => {
                let session = self
                    .group
                    .as_deref()
                    .or(self.session.as_deref())
                    .unwrap_or_default();
                let id = attempt_from_fields(athlete, attempt, lift, session)?;
                Ok(Some(Event::Start(id)))
            }
            STOP_TIME => Ok(Some(Event::Stop)),
            other => {
                debug!("Timer event {} does not affect recording", other);
                Ok(None)
            }
        }
    }
}

impl DecisionForm {
    pub fn into_event(self) -> Result<Option<Event>, EventError> {
        let state = required("fopState", &self.fop_state)?;
        let kind = required("decisionEventType", &self.decision_event_type)?;
        required("fullName", &self.full_name)?;
        required("attemptNumber", &self.attempt_number)?;
        required("liftTypeKey", &self.lift_type_key)?;

        if state == DECISION_VISIBLE && kind != RESET {
            Ok(Some(Event::Decision))
        } else {
            debug!("Decision {} in state {} ignored", kind, state);
            Ok(None)
        }
    }
}
