//! Working and final filenames
//!
//! Working files carry the `startAt` timestamp as a suffix; final clips lead
//! with a wall-clock date. The two never collide.

use super::AttemptId;
use crate::clock::clip_timestamp;

/// Directory used when no session is active
pub const UNSORTED_SESSION: &str = "unsorted";

/// Spaces become underscores; path separators are never allowed through
pub fn sanitize(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            ' ' | '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

/// `<session_underscored>` or `unsorted`
pub fn session_dir_name(session: &str) -> String {
    let name = sanitize(session);
    if name.is_empty() || name == "." || name == ".." {
        UNSORTED_SESSION.to_string()
    } else {
        name
    }
}

/// `<athlete>_<lift>_attempt<n>_Camera<i>_<startAtMs>.<container>`
pub fn working_file_name(id: &AttemptId, camera: u32, start_at_ms: i64, container: &str) -> String {
    format!("{}_Camera{}_{}.{}", id, camera, start_at_ms, container)
}

/// `YYYY-MM-DD_HHhMMmSSs_<athlete>_<lift>_attempt<n>_Camera<i>.mp4`
pub fn final_clip_name(id: &AttemptId, camera: u32, wall_ms: i64) -> String {
    format!("{}_{}_Camera{}.mp4", clip_timestamp(wall_ms), id, camera)
}
