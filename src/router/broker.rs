//! Broker topic and payload decoding
//!
//! Topics live under a configurable root:
//! `<root>/start/<platform>`, `<root>/stop/<platform>`,
//! `<root>/refereesDecision/<platform>`, `<root>/break`, `<root>/config`.
//!
//! No broker client lives here. Any transport that yields `(topic, payload)`
//! pairs can feed [`EventRouter::broker_message`](super::EventRouter::broker_message),
//! e.g. the line feed below reading `mosquitto_sub -v` output.

use serde::Deserialize;
use std::sync::RwLock;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{attempt_from_fields, Event, EventError, EventRouter};
use crate::config::BrokerConfig;

/// `break` payload sent when a session (group) is over
pub const GROUP_DONE: &str = "GROUP_DONE";

#[derive(Debug, PartialEq, Eq)]
enum Topic {
    Start(String),
    Stop(String),
    Decision(String),
    Break,
    Config,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    athlete_name: Option<String>,
    attempt_number: Option<serde_json::Value>,
    lift_type: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlatformAnnouncement {
    platforms: Vec<String>,
}

/// Topic layout plus the platform we listen to.
///
/// An empty platform accepts every platform until the scoring server
/// announces exactly one, which is then adopted.
#[derive(Debug)]
pub struct BrokerTopics {
    root: String,
    platform: RwLock<String>,
}

impl BrokerTopics {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            root: config.topic_root.trim().trim_end_matches('/').to_string(),
            platform: RwLock::new(config.platform.trim().to_string()),
        }
    }

    pub fn platform(&self) -> String {
        self.platform
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Topic filters a transport should subscribe to
    pub fn subscriptions(&self) -> Vec<String> {
        let platform = self.platform();
        let platform = if platform.is_empty() { "+" } else { platform.as_str() };
        vec![
            format!("{}/start/{}", self.root, platform),
            format!("{}/stop/{}", self.root, platform),
            format!("{}/refereesDecision/{}", self.root, platform),
            format!("{}/break", self.root),
            format!("{}/config", self.root),
        ]
    }

    fn classify(&self, topic: &str) -> Result<Topic, EventError> {
        let unknown = || EventError::UnknownTopic(topic.to_string());
        let rest = topic
            .strip_prefix(self.root.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(unknown)?;

        let (kind, platform) = match rest.split_once('/') {
            Some((kind, platform)) => (kind, Some(platform)),
            None => (rest, None),
        };

        match (kind, platform) {
            ("start", Some(p)) if !p.is_empty() => Ok(Topic::Start(p.to_string())),
            ("stop", Some(p)) if !p.is_empty() => Ok(Topic::Stop(p.to_string())),
            ("refereesDecision", Some(p)) if !p.is_empty() => Ok(Topic::Decision(p.to_string())),
            ("break", _) => Ok(Topic::Break),
            ("config", None) => Ok(Topic::Config),
            _ => Err(unknown()),
        }
    }

    fn accepts(&self, platform: &str) -> bool {
        let ours = self.platform();
        if ours.is_empty() || ours == platform {
            true
        } else {
            debug!("Ignoring platform {} (listening to {})", platform, ours);
            false
        }
    }

    /// Decode one message. `Ok(None)` means understood but nothing to do.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Option<Event>, EventError> {
        let payload = std::str::from_utf8(payload)
            .map_err(|_| EventError::InvalidField {
                field: "payload",
                reason: "not UTF-8".to_string(),
            })?
            .trim();

        match self.classify(topic)? {
            Topic::Config => {
                self.adopt_platform(payload)?;
                Ok(None)
            }
            Topic::Break => Ok((payload == GROUP_DONE).then_some(Event::SessionEnd)),
            Topic::Start(platform) => {
                if !self.accepts(&platform) {
                    return Ok(None);
                }
                Ok(Some(Event::Start(parse_start(payload)?)))
            }
            Topic::Stop(platform) => Ok(self.accepts(&platform).then_some(Event::Stop)),
            Topic::Decision(platform) => Ok(self.accepts(&platform).then_some(Event::Decision)),
        }
    }

    fn adopt_platform(&self, payload: &str) -> Result<(), EventError> {
        let announced: PlatformAnnouncement =
            serde_json::from_str(payload).map_err(|e| EventError::InvalidField {
                field: "platforms",
                reason: e.to_string(),
            })?;

        let mut platform = self.platform.write().unwrap_or_else(|e| e.into_inner());
        if platform.is_empty() {
            if let [only] = announced.platforms.as_slice() {
                info!("Adopting platform {}", only);
                *platform = only.clone();
            } else {
                info!(
                    "Scoring server runs {} platforms, set broker.platform to pick one",
                    announced.platforms.len()
                );
            }
        } else if !announced.platforms.contains(&platform) {
            warn!(
                "Platform {} is not among the announced platforms {:?}",
                platform, announced.platforms
            );
        }
        Ok(())
    }
}

/// `{"athleteName":…,"attemptNumber":…,"liftType":…,"session":…} <timestamp>`
fn parse_start(payload: &str) -> Result<crate::attempt::AttemptId, EventError> {
    let end = payload.rfind('}').ok_or(EventError::MissingField("athleteName"))?;
    let (json, suffix) = payload.split_at(end + 1);
    if let Some(ts) = suffix.split_whitespace().next() {
        // the local clock anchors attempts; the sender's stamp is only logged
        debug!("Start sent at {}", ts);
    }

    let start: StartPayload = serde_json::from_str(json).map_err(|e| EventError::InvalidField {
        field: "payload",
        reason: e.to_string(),
    })?;

    let athlete = start
        .athlete_name
        .ok_or(EventError::MissingField("athleteName"))?;
    let attempt = match start.attempt_number {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => {
            return Err(EventError::InvalidField {
                field: "attemptNumber",
                reason: format!("unexpected {}", other),
            })
        }
        None => return Err(EventError::MissingField("attemptNumber")),
    };
    let lift = start.lift_type.ok_or(EventError::MissingField("liftType"))?;

    attempt_from_fields(
        &athlete,
        &attempt,
        &lift,
        start.session.as_deref().unwrap_or_default(),
    )
}

/// Feed `topic payload` lines (the `mosquitto_sub -v` format) into the router
pub async fn run_line_feed<R>(reader: R, router: EventRouter, shutdown: CancellationToken)
where
    R: AsyncBufRead + Unpin,
{
    info!("Reading broker messages from line feed");
    let mut lines = reader.lines();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let (topic, payload) = line.split_once(' ').unwrap_or((line, ""));
                    router.broker_message(topic, payload.as_bytes()).await;
                }
                Ok(None) => {
                    info!("Broker line feed closed");
                    break;
                }
                Err(e) => {
                    warn!("Broker line feed failed: {}", e);
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::LiftType;

    fn topics(platform: &str) -> BrokerTopics {
        BrokerTopics::new(&BrokerConfig {
            topic_root: "owlcms/fop/".to_string(),
            platform: platform.to_string(),
        })
    }

    #[test]
    fn test_classify() {
        let t = topics("A");
        assert_eq!(t.classify("owlcms/fop/start/A").unwrap(), Topic::Start("A".into()));
        assert_eq!(
            t.classify("owlcms/fop/refereesDecision/B").unwrap(),
            Topic::Decision("B".into())
        );
        assert_eq!(t.classify("owlcms/fop/break").unwrap(), Topic::Break);
        assert_eq!(t.classify("owlcms/fop/config").unwrap(), Topic::Config);
        assert!(matches!(
            t.classify("owlcms/fop/start"),
            Err(EventError::UnknownTopic(_))
        ));
        assert!(matches!(
            t.classify("other/start/A"),
            Err(EventError::UnknownTopic(_))
        ));
    }

    #[test]
    fn test_start_payload() {
        let t = topics("A");
        let event = t
            .decode(
                "owlcms/fop/start/A",
                br#"{"athleteName":"Alice Li","attemptNumber":"1","liftType":"SNATCH","session":"Senior Women 64kg"} 1712345678901"#,
            )
            .unwrap();
        let Some(Event::Start(id)) = event else {
            panic!("expected a start, got {:?}", event);
        };
        assert_eq!(id.athlete, "Alice Li");
        assert_eq!(id.lift_type, LiftType::Snatch);
        assert_eq!(id.attempt, 1);
        assert_eq!(id.session, "Senior Women 64kg");

        // the timestamp suffix is optional
        assert!(t
            .decode(
                "owlcms/fop/start/A",
                br#"{"athleteName":"Bob","attemptNumber":2,"liftType":"CLEANJERK"}"#,
            )
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_start_payload_missing_fields() {
        let t = topics("A");
        assert_eq!(
            t.decode(
                "owlcms/fop/start/A",
                br#"{"attemptNumber":1,"liftType":"SNATCH"} 1"#
            ),
            Err(EventError::MissingField("athleteName"))
        );
        assert_eq!(
            t.decode("owlcms/fop/start/A", b"no json here"),
            Err(EventError::MissingField("athleteName"))
        );
    }

    #[test]
    fn test_break_and_platform_filter() {
        let t = topics("A");
        assert_eq!(
            t.decode("owlcms/fop/break", b"GROUP_DONE").unwrap(),
            Some(Event::SessionEnd)
        );
        assert_eq!(t.decode("owlcms/fop/break", b"BREAK_TECHNICAL").unwrap(), None);
        assert_eq!(t.decode("owlcms/fop/stop/B", b"").unwrap(), None);
        assert_eq!(t.decode("owlcms/fop/stop/A", b"").unwrap(), Some(Event::Stop));
    }

    #[test]
    fn test_platform_adoption() {
        let t = topics("");
        // before adoption every platform is accepted
        assert_eq!(t.decode("owlcms/fop/stop/B", b"").unwrap(), Some(Event::Stop));

        t.decode("owlcms/fop/config", br#"{"platforms":["A","B"]}"#).unwrap();
        assert_eq!(t.platform(), "");

        t.decode("owlcms/fop/config", br#"{"platforms":["Main"]}"#).unwrap();
        assert_eq!(t.platform(), "Main");
        assert_eq!(t.decode("owlcms/fop/stop/B", b"").unwrap(), None);
        assert!(t.subscriptions().contains(&"owlcms/fop/start/Main".to_string()));

        assert!(t.decode("owlcms/fop/config", b"[]").is_err());
    }
}
