//! Watches the certificate directory so an external renewer (or our own ACME
//! manager) can drop new material and have the HTTPS listener pick it up
//! without a process restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::error::KnaryError;
use crate::notify::EventRouter;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll the directory at 1s granularity and publish a restart signal when a
/// file (not a directory) changes. A missing directory at startup is fatal;
/// the HTTPS listener would silently serve stale material otherwise.
pub async fn watch_certs(
    dir: PathBuf,
    restart_tx: mpsc::Sender<()>,
    events: EventRouter,
) -> Result<(), KnaryError> {
    let mut seen = scan_dir(&dir)?;
    info!("Watching {dir:?} for certificate changes");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        // mid-life filesystem failure is fatal too, per the same logic
        let current = scan_dir(&dir)?;
        let changed = changed_files(&seen, &current);
        if changed.is_empty() {
            seen = current;
            continue;
        }

        for path in &changed {
            info!("Certificate material changed: {path:?}");
        }
        let msg =
            "TLS material changed! The HTTPS listener will be restarted with the new certificate.";
        events.publish(msg);
        if let Err(error) = restart_tx.send(()).await {
            warn!("HTTPS listener went away, stopping the cert watcher: {error}");
            return Err(KnaryError::Send(error.to_string()));
        }
        seen = current;
    }
}

type FileState = HashMap<PathBuf, (SystemTime, u64)>;

fn scan_dir(dir: &Path) -> Result<FileState, KnaryError> {
    let mut state = FileState::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        state.insert(path, (modified, meta.len()));
    }
    Ok(state)
}

fn changed_files(before: &FileState, after: &FileState) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, state)| before.get(*path) != Some(state))
        .map(|(path, _)| path.clone())
        .collect();
    changed.sort();
    debug!("cert watcher diff: {} changed", changed.len());
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_scan_missing_dir_is_an_error() {
        assert!(scan_dir(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn test_changed_files_ignores_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.crt"), b"one").expect("write");
        let before = scan_dir(dir.path()).expect("scan");
        let after = scan_dir(dir.path()).expect("scan");
        assert!(changed_files(&before, &after).is_empty());

        std::fs::write(dir.path().join("a.crt"), b"two-longer").expect("write");
        let after = scan_dir(dir.path()).expect("scan");
        assert_eq!(changed_files(&before, &after).len(), 1);
    }

    #[test]
    fn test_new_file_counts_as_changed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let before = scan_dir(dir.path()).expect("scan");
        std::fs::write(dir.path().join("fresh.key"), b"key").expect("write");
        let after = scan_dir(dir.path()).expect("scan");
        assert_eq!(changed_files(&before, &after).len(), 1);
    }

    #[test]
    fn test_subdirectories_are_not_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let before = scan_dir(dir.path()).expect("scan");
        std::fs::create_dir(dir.path().join("archives")).expect("mkdir");
        let after = scan_dir(dir.path()).expect("scan");
        assert!(changed_files(&before, &after).is_empty());
    }

    #[tokio::test]
    async fn test_watcher_signals_on_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("x.crt"), b"before").expect("write");

        let (tx, mut rx) = mpsc::channel(4);
        let events = EventRouter::default();
        let path = dir.path().to_path_buf();
        let watcher = tokio::spawn(watch_certs(path, tx, events));

        // give the watcher a moment to take its baseline, then touch the file
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("x.crt"), b"after-renewal").expect("write");

        let signal = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal within the polling window");
        assert!(signal.is_some());
        watcher.abort();
    }
}
