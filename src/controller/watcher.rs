//! Debounced assembly change notifications

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::Result;

/// Watches the directories of a set of assemblies
///
/// A rebuild usually touches a file several times in quick succession; the
/// changes are collapsed into one notification once `debounce` has passed
/// without further activity.
pub struct AssemblyWatcher {
    _watcher: RecommendedWatcher,
    debounce: JoinHandle<()>,
}

impl AssemblyWatcher {
    /// Start watching; changed assembly paths arrive on the returned receiver
    pub fn start(assemblies: &[PathBuf], debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let names: HashSet<OsString> = assemblies.iter().filter_map(|a| a.file_name().map(OsString::from)).collect();
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                for path in event.paths {
                    if path.file_name().is_some_and(|n| names.contains(n)) {
                        let _ = raw_tx.send(path);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        })?;

        let mut dirs: Vec<&Path> = assemblies.iter().filter_map(|a| a.parent()).collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            let dir = if dir.as_os_str().is_empty() { Path::new(".") } else { dir };
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            tracing::debug!(dir = %dir.display(), "Watching for assembly changes");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let debounce = tokio::spawn(debounce_changes(raw_rx, tx, debounce));

        Ok((
            Self {
                _watcher: watcher,
                debounce,
            },
            rx,
        ))
    }
}

impl Drop for AssemblyWatcher {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

/// Forward the last path of every burst of changes
async fn debounce_changes(
    mut raw: mpsc::UnboundedReceiver<PathBuf>,
    out: mpsc::UnboundedSender<PathBuf>,
    quiet: Duration,
) {
    while let Some(mut last) = raw.recv().await {
        loop {
            match tokio::time::timeout(quiet, raw.recv()).await {
                Ok(Some(path)) => last = path,
                Ok(None) | Err(_) => break,
            }
        }

        tracing::debug!(path = %last.display(), "Assembly changed");
        if out.send(last).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_collapses_into_one_change() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(debounce_changes(raw_rx, tx, Duration::from_millis(50)));

        for _ in 0..5 {
            raw_tx.send(PathBuf::from("a.dll")).unwrap();
        }
        raw_tx.send(PathBuf::from("b.dll")).unwrap();

        assert_eq!(rx.recv().await, Some(PathBuf::from("b.dll")));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        raw_tx.send(PathBuf::from("a.dll")).unwrap();
        assert_eq!(rx.recv().await, Some(PathBuf::from("a.dll")));
    }

    #[tokio::test]
    async fn test_writing_an_assembly_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let assembly = dir.path().join("unit.dll");
        std::fs::write(&assembly, b"v1").unwrap();

        let (_watcher, mut rx) = AssemblyWatcher::start(&[assembly.clone()], Duration::from_millis(50)).unwrap();
        std::fs::write(dir.path().join("other.txt"), b"ignored").unwrap();
        std::fs::write(&assembly, b"v2").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(changed.file_name(), assembly.file_name());
    }
}
