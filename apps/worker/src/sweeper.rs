//! Scratch directory cleanup
//!
//! Job commands leave partial downloads and transcodes behind when they
//! crash or are killed. Files older than the max age are removed on a fixed
//! interval; directories are left in place.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::ScratchConfig;
use crate::error::{WorkerError, WorkerResult};

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed: usize,
    pub bytes: u64,
    pub errors: usize,
}

/// Create the scratch directory if needed
pub fn ensure_dir(dir: &Path) -> WorkerResult<()> {
    if dir.exists() && !dir.is_dir() {
        return Err(WorkerError::Configuration(format!(
            "scratch path {} is not a directory",
            dir.display()
        )));
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove every file under `dir` last modified more than `max_age` ago
pub fn sweep(dir: &Path, max_age: Duration) -> WorkerResult<SweepStats> {
    let mut stats = SweepStats::default();
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return Ok(stats);
    };

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // The root itself being unreadable is fatal for the sweep
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable scratch entry");
                stats.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(path = ?entry.path(), error = %e, "Cannot stat scratch file");
                stats.errors += 1;
                continue;
            }
        };
        let stale = metadata.modified().map_or(false, |modified| modified < cutoff);
        if !stale {
            continue;
        }

        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                stats.removed += 1;
                stats.bytes += metadata.len();
            }
            Err(e) => {
                tracing::warn!(path = ?entry.path(), error = %e, "Failed to remove stale scratch file");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// Sweep every `config.sweep_interval()` until cancelled
pub async fn run(config: ScratchConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let dir: PathBuf = config.dir.clone();
        let max_age = config.max_age();
        match tokio::task::spawn_blocking(move || sweep(&dir, max_age)).await {
            Ok(Ok(stats)) if stats.removed > 0 => tracing::info!(
                removed = stats.removed,
                bytes = stats.bytes,
                "Removed stale scratch files"
            ),
            Ok(Ok(_)) => tracing::trace!("Scratch directory clean"),
            Ok(Err(e)) => e.log(),
            Err(e) => tracing::error!(error = %e, "Scratch sweep task failed"),
        }
    }

    tracing::debug!("Scratch sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;

    fn write_file(path: &Path, bytes: &[u8], age: Duration) {
        let mut file = File::create(path).unwrap();
        file.write_all(bytes).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn test_sweep_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("job-1");
        fs::create_dir(&nested).unwrap();

        write_file(&dir.path().join("old.part"), b"12345", Duration::from_secs(3600));
        write_file(&nested.join("old.mp3"), b"123", Duration::from_secs(900));
        write_file(&dir.path().join("fresh.part"), b"1", Duration::from_secs(5));

        let stats = sweep(dir.path(), Duration::from_secs(600)).unwrap();
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.bytes, 8);
        assert_eq!(stats.errors, 0);

        assert!(dir.path().join("fresh.part").exists());
        assert!(!dir.path().join("old.part").exists());
        assert!(nested.exists(), "directories are kept");
    }

    #[test]
    fn test_sweep_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(sweep(&missing, Duration::from_secs(600)).is_err());
    }

    #[test]
    fn test_ensure_dir() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("a/b");
        ensure_dir(&scratch).unwrap();
        assert!(scratch.is_dir());
        ensure_dir(&scratch).unwrap();

        let file = dir.path().join("plain");
        File::create(&file).unwrap();
        assert!(matches!(ensure_dir(&file), Err(WorkerError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScratchConfig {
            dir: dir.path().to_path_buf(),
            max_age_secs: 600,
            sweep_interval_secs: 60,
        };
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run(config, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(125)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
