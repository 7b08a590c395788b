//! Session index - read-only view of the published clip tree
//!
//! `<video_dir>/<session>/<YYYY-MM-DD_HHhMMmSSs>_<athlete>_<LIFT>_attempt<n>_Camera<i>.mp4`
//!
//! Nothing is cached: every call walks the directory again.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;
use thiserror::Error;
use tracing::debug;

use crate::attempt::session_dir_name;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no such session or clip: {0}")]
    NotFound(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("session index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn clip_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2}_\d{2}h\d{2}m\d{2}s)_(.+)_([A-Za-z]+)_attempt(\d+)_Camera(\d+)\.mp4$",
        )
        .expect("clip pattern is valid")
    })
}

/// One published clip
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClipEntry {
    pub session: String,
    pub file_name: String,
    pub recorded_at: NaiveDateTime,
    /// Athlete name with underscores turned back into spaces
    pub athlete: String,
    pub lift: String,
    pub attempt: u32,
    pub camera: u32,
}

impl ClipEntry {
    /// Parse a final clip name; anything else in the tree is skipped
    pub fn parse(session: &str, file_name: &str) -> Option<Self> {
        let caps = clip_pattern().captures(file_name)?;
        let recorded_at = NaiveDateTime::parse_from_str(&caps[1], "%Y-%m-%d_%Hh%Mm%Ss").ok()?;
        Some(Self {
            session: session.to_string(),
            file_name: file_name.to_string(),
            recorded_at,
            athlete: caps[2].replace('_', " "),
            lift: caps[3].to_string(),
            attempt: caps[4].parse().ok()?,
            camera: caps[5].parse().ok()?,
        })
    }

    /// Path under the `/videos` mount
    pub fn url(&self) -> String {
        format!("/videos/{}/{}", self.session, self.file_name)
    }
}

/// A session directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEntry {
    pub name: String,
    #[serde(skip)]
    pub modified: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Listing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipOrder {
    /// Most recent first
    #[default]
    Newest,
    /// By athlete, then by time in the given direction
    Athlete(SortDirection),
}

impl ClipOrder {
    /// From the `sort`/`order` query parameters
    pub fn from_query(sort: Option<&str>, order: Option<&str>) -> Self {
        let direction = match order {
            Some(o) if o.eq_ignore_ascii_case("desc") => SortDirection::Desc,
            _ => SortDirection::Asc,
        };
        match sort {
            Some(s) if s.eq_ignore_ascii_case("athlete") => ClipOrder::Athlete(direction),
            _ => ClipOrder::Newest,
        }
    }

    fn compare(&self, a: &ClipEntry, b: &ClipEntry) -> Ordering {
        match self {
            ClipOrder::Newest => b
                .recorded_at
                .cmp(&a.recorded_at)
                .then(a.camera.cmp(&b.camera)),
            ClipOrder::Athlete(direction) => {
                let by_time = match direction {
                    SortDirection::Asc => a.recorded_at.cmp(&b.recorded_at),
                    SortDirection::Desc => b.recorded_at.cmp(&a.recorded_at),
                };
                a.athlete
                    .to_lowercase()
                    .cmp(&b.athlete.to_lowercase())
                    .then(by_time)
                    .then(a.camera.cmp(&b.camera))
            }
        }
    }
}

/// Reads the session tree under the video directory
#[derive(Debug, Clone)]
pub struct SessionIndex {
    video_dir: PathBuf,
}

impl SessionIndex {
    pub fn new(video_dir: impl Into<PathBuf>) -> Self {
        Self {
            video_dir: video_dir.into(),
        }
    }

    pub fn video_dir(&self) -> &Path {
        &self.video_dir
    }

    /// Session directories, most recently modified first.
    /// Hidden directories (the capture working dir) are skipped.
    pub fn sessions(&self) -> Result<Vec<SessionEntry>, SessionError> {
        let entries = match std::fs::read_dir(&self.video_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }
            sessions.push(SessionEntry {
                name,
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        sessions.sort_by(|a, b| b.modified.cmp(&a.modified).then(a.name.cmp(&b.name)));
        Ok(sessions)
    }

    /// Directory name for a session, refusing anything that escapes the tree
    fn session_path(&self, session: &str) -> Result<PathBuf, SessionError> {
        if session.is_empty()
            || session.starts_with('.')
            || session.contains(['/', '\\'])
        {
            return Err(SessionError::InvalidName(session.to_string()));
        }
        Ok(self.video_dir.join(session))
    }

    /// Published clips of one session directory
    pub fn clips(&self, session: &str, order: ClipOrder) -> Result<Vec<ClipEntry>, SessionError> {
        let dir = self.session_path(session)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::NotFound(session.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut clips = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            match ClipEntry::parse(session, &file_name) {
                Some(clip) => clips.push(clip),
                None => debug!("Skipping {} in {}", file_name, session),
            }
        }

        clips.sort_by(|a, b| order.compare(a, b));
        Ok(clips)
    }

    /// Most recent clip for `camera` in the current session, or in the
    /// latest session when none is active or it has no directory yet
    pub fn latest_clip(
        &self,
        camera: u32,
        current_session: Option<&str>,
    ) -> Result<Option<PathBuf>, SessionError> {
        let current = current_session
            .filter(|s| !s.trim().is_empty())
            .map(session_dir_name)
            .filter(|dir| self.video_dir.join(dir).is_dir());

        let session = match current {
            Some(dir) => dir,
            None => match self.sessions()?.into_iter().next() {
                Some(latest) => latest.name,
                None => return Ok(None),
            },
        };

        let latest = self
            .clips(&session, ClipOrder::Newest)?
            .into_iter()
            .filter(|clip| clip.camera == camera)
            .max_by(|a, b| {
                a.recorded_at
                    .cmp(&b.recorded_at)
                    .then(a.file_name.cmp(&b.file_name))
            });

        Ok(latest.map(|clip| self.video_dir.join(&clip.session).join(&clip.file_name)))
    }
}
