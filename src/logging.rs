use anyhow::{Context, Result};
#[cfg(not(target_os = "macos"))]
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_BASENAME: &str = "jury-replays.log";
const LOG_DIR_ENV: &str = "JURY_REPLAYS_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Subsystem for macOS unified logging (os_log)
#[cfg(target_os = "macos")]
const OSLOG_SUBSYSTEM: &str = "org.owlcms.jury-replays";

/// Get the log directory path
pub fn get_log_dir() -> Result<PathBuf> {
    resolve_log_dir()
}

/// Install the global subscriber: rolling file, stderr and (on macOS) os_log.
///
/// The returned guard flushes the file writer when dropped, so `main` keeps
/// it alive for the whole run.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    let pruned = prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    #[cfg(target_os = "macos")]
    {
        // Visible with `log stream --predicate 'subsystem == "org.owlcms.jury-replays"'`
        let oslog_layer = tracing_oslog::OsLogger::new(OSLOG_SUBSYSTEM, "default");

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .with(oslog_layer)
            .try_init()
            .context("Failed to install the tracing subscriber")?;
    }

    #[cfg(not(target_os = "macos"))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(stderr_layer)
            .try_init()
            .context("Failed to install the tracing subscriber")?;
    }

    tracing::debug!("Logging to {:?} ({} old files pruned)", log_dir, pruned);
    Ok(guard)
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(LOG_DIR_ENV) {
        if !override_path.trim().is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }

    #[cfg(target_os = "macos")]
    {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .context("Failed to determine home directory for log path")?;
        return Ok(home.join("Library").join("Logs").join("jury-replays"));
    }

    #[cfg(not(target_os = "macos"))]
    {
        let proj_dirs = ProjectDirs::from("org", "owlcms", "jury-replays")
            .context("Failed to determine project directories for log path")?;

        #[cfg(target_os = "windows")]
        {
            return Ok(proj_dirs.data_local_dir().join("Logs"));
        }

        #[cfg(not(target_os = "windows"))]
        {
            let base = proj_dirs
                .state_dir()
                .unwrap_or_else(|| proj_dirs.data_local_dir());
            Ok(base.join("logs"))
        }
    }
}

/// Delete our own log files last written before `max_age` ago.
/// Returns how many were removed.
fn prune_old_logs(log_dir: &Path, max_age: Duration) -> usize {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };

    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }

        let is_ours = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_BASENAME));
        if !is_ours {
            continue;
        }

        let modified = entry.metadata().and_then(|m| m.modified());
        match modified {
            Ok(modified) if modified < cutoff => {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
            _ => {}
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let recent = dir.path().join(format!("{}.2024-04-05", LOG_FILE_BASENAME));
        let foreign = dir.path().join("other.log");
        std::fs::write(&recent, "recent").unwrap();
        std::fs::write(&foreign, "foreign").unwrap();

        // Anything written before the sleep is past a 1 ms max age
        std::thread::sleep(Duration::from_millis(20));
        let removed = prune_old_logs(dir.path(), Duration::from_millis(1));
        assert_eq!(removed, 1);
        assert!(!recent.exists());
        assert!(foreign.exists());

        let kept = dir.path().join(LOG_FILE_BASENAME);
        std::fs::write(&kept, "today").unwrap();
        assert_eq!(prune_old_logs(dir.path(), Duration::from_secs(3600)), 0);
        assert!(kept.exists());
    }

    #[test]
    fn test_prune_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(prune_old_logs(&dir.path().join("absent"), Duration::ZERO), 0);
    }
}
