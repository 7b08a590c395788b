//! Attempt identity and timing
//!
//! An attempt is one try by one athlete at one lift. Its identity is fixed
//! when the clock is started for it; its timing anchors are filled in as
//! the clock stops and the referees decide.

mod naming;
mod state;

pub use naming::{final_clip_name, sanitize, session_dir_name, working_file_name};
pub use state::{AttemptSnapshot, AttemptState};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lift being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiftType {
    Snatch,
    #[serde(rename = "CLEANJERK")]
    CleanJerk,
}

impl LiftType {
    /// Key used in filenames and on the wire
    pub fn key(&self) -> &'static str {
        match self {
            LiftType::Snatch => "SNATCH",
            LiftType::CleanJerk => "CLEANJERK",
        }
    }

    /// Name shown to people
    pub fn label(&self) -> &'static str {
        match self {
            LiftType::Snatch => "Snatch",
            LiftType::CleanJerk => "Clean & Jerk",
        }
    }
}

impl fmt::Display for LiftType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for LiftType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match folded.as_str() {
            "SNATCH" => Ok(LiftType::Snatch),
            // "Clean and Jerk" and "C&J" appear in older filenames
            "CLEANJERK" | "CLEANANDJERK" | "CJ" => Ok(LiftType::CleanJerk),
            _ => Err(format!("unknown lift type: {}", s)),
        }
    }
}

/// Identity of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptId {
    pub athlete: String,
    pub lift_type: LiftType,
    /// 1..=3
    pub attempt: u8,
    /// Session (group) name; may be empty
    pub session: String,
}

impl AttemptId {
    pub const MAX_ATTEMPT: u8 = 3;

    pub fn new(
        athlete: impl Into<String>,
        lift_type: LiftType,
        attempt: u8,
        session: impl Into<String>,
    ) -> Result<Self, String> {
        let athlete = athlete.into().trim().to_string();
        if athlete.is_empty() {
            return Err("athlete name is empty".to_string());
        }
        if attempt == 0 || attempt > Self::MAX_ATTEMPT {
            return Err(format!("attempt number {} is not in 1..=3", attempt));
        }
        Ok(Self {
            athlete,
            lift_type,
            attempt,
            session: session.into().trim().to_string(),
        })
    }

    /// Human description used in status text
    pub fn describe(&self) -> String {
        format!(
            "{} - {} attempt {}",
            self.athlete,
            self.lift_type.label(),
            self.attempt
        )
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_attempt{}",
            sanitize(&self.athlete),
            self.lift_type.key(),
            self.attempt
        )
    }
}
