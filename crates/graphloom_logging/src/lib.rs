//! Logging bootstrap shared by Graphloom binaries.
//!
//! Each role (worker, scheduler, reaper, ...) appends to its own
//! date-stamped file under the graphloom home directory; stderr only
//! carries warnings unless verbose mode is on. Retention happens at
//! startup: stale date-stamped files for the role are pruned, so no
//! rotation logic runs while the process is up.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "graphloom=info,graphloom_worker=info,graphloom_conductor=info,graphloom_kv=info";

/// Date-stamped files kept per role; older ones are pruned at startup.
const KEPT_LOG_FILES: usize = 7;

/// Logging configuration shared by Graphloom binaries.
pub struct LogConfig<'a> {
    /// Role name used in the log file name (usually the subcommand,
    /// e.g. "worker").
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a date-stamped file writer and stderr
/// output. One process appends to one file, so a mutex-guarded handle
/// is all the writer machinery needed.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file = open_dated_log(&log_dir, config.app_name)?;
    prune_stale_logs(&log_dir, config.app_name, KEPT_LOG_FILES);

    let console_filter = if config.verbose {
        default_filter()
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(default_filter()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Graphloom home directory: ~/.graphloom (or $GRAPHLOOM_HOME).
pub fn graphloom_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("GRAPHLOOM_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".graphloom")
}

/// Logs directory: ~/.graphloom/logs, created on demand.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = graphloom_home().join("logs");
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Open (or continue) today's log file for a role. Restarts on the
/// same day keep appending to the same file.
fn open_dated_log(dir: &Path, app_name: &str) -> Result<File> {
    let path = dir.join(format!("{app_name}-{}.log", Utc::now().format("%Y%m%d")));
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))
}

/// Best-effort retention: keep the newest `keep` date-stamped files
/// for this role, delete the rest. Files of other roles and anything
/// that does not look like `<role>-<stamp>.log` are left alone.
fn prune_stale_logs(dir: &Path, app_name: &str, keep: usize) {
    let prefix = format!("{app_name}-");
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };

    let mut dated: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_prefix(&prefix))
                .and_then(|rest| rest.strip_suffix(".log"))
                .is_some_and(|stamp| !stamp.is_empty() && stamp.chars().all(|c| c.is_ascii_digit()))
        })
        .collect();

    if dated.len() <= keep {
        return;
    }

    // The date stamp sorts lexicographically, oldest first.
    dated.sort();
    for stale in &dated[..dated.len() - keep] {
        let _ = fs::remove_file(stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn dated_log_appends_to_one_file_per_day() {
        let dir = TempDir::new().unwrap();

        let mut first = open_dated_log(dir.path(), "worker").unwrap();
        writeln!(first, "one").unwrap();
        drop(first);
        let mut second = open_dated_log(dir.path(), "worker").unwrap();
        writeln!(second, "two").unwrap();
        drop(second);

        let files: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let content = fs::read_to_string(files[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content, "one\ntwo\n");
    }

    #[test]
    fn pruning_keeps_the_newest_files_per_role() {
        let dir = TempDir::new().unwrap();
        for stamp in ["20240101", "20240102", "20240103", "20240104"] {
            fs::write(dir.path().join(format!("worker-{stamp}.log")), "x").unwrap();
        }
        fs::write(dir.path().join("reaper-20240101.log"), "x").unwrap();
        fs::write(dir.path().join("worker-notes.log"), "x").unwrap();

        prune_stale_logs(dir.path(), "worker", 2);

        assert!(!dir.path().join("worker-20240101.log").exists());
        assert!(!dir.path().join("worker-20240102.log").exists());
        assert!(dir.path().join("worker-20240103.log").exists());
        assert!(dir.path().join("worker-20240104.log").exists());
        // Another role's file and a non-dated file survive.
        assert!(dir.path().join("reaper-20240101.log").exists());
        assert!(dir.path().join("worker-notes.log").exists());
    }

    #[test]
    fn pruning_under_the_cap_removes_nothing() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("worker-20240101.log"), "x").unwrap();
        prune_stale_logs(dir.path(), "worker", 2);
        assert!(dir.path().join("worker-20240101.log").exists());
    }
}
