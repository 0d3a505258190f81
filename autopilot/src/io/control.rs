//! File-based stop/pause requests for a running batch.
//!
//! `autopilot stop` and `autopilot pause` drop marker files under
//! `.autopilot/state/`; the running loop polls them and flips its cancel token.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::pipeline::context::CancelToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ControlFiles {
    stop_path: PathBuf,
    pause_path: PathBuf,
}

impl ControlFiles {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            stop_path: state_dir.join("STOP"),
            pause_path: state_dir.join("PAUSE"),
        }
    }

    pub fn request_stop(&self) -> Result<()> {
        touch(&self.stop_path)
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        if paused {
            return touch(&self.pause_path);
        }
        remove_if_exists(&self.pause_path)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path.exists()
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_path.exists()
    }

    /// Remove a stale stop request left by an earlier run.
    pub fn clear_stop(&self) -> Result<()> {
        remove_if_exists(&self.stop_path)
    }

    /// Poll the marker files on a background thread until the watcher is stopped.
    pub fn watch(self, cancel: Arc<CancelToken>) -> ControlWatcher {
        let done = Arc::new(AtomicBool::new(false));
        let handle = {
            let done = done.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    self.apply(&cancel);
                    thread::sleep(POLL_INTERVAL);
                }
            })
        };
        ControlWatcher {
            done,
            handle: Some(handle),
        }
    }

    fn apply(&self, cancel: &CancelToken) {
        if self.stop_requested() && !cancel.is_cancelled() {
            info!("stop requested");
            cancel.cancel();
        }
        let paused = self.pause_requested();
        if paused != cancel.is_paused() {
            debug!(paused, "pause state changed");
            if paused {
                cancel.pause();
            } else {
                cancel.resume();
            }
        }
    }
}

/// Background poller started by [`ControlFiles::watch`].
#[derive(Debug)]
pub struct ControlWatcher {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ControlWatcher {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("control watcher panicked");
        }
    }
}

impl Drop for ControlWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn touch(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, "").with_context(|| format!("write {}", path.display()))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_files_drive_the_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = ControlFiles::new(temp.path());
        let token = CancelToken::new();

        files.set_paused(true).expect("pause");
        files.apply(&token);
        assert!(token.is_paused());

        files.set_paused(false).expect("unpause");
        files.apply(&token);
        assert!(!token.is_paused());

        files.request_stop().expect("stop");
        files.apply(&token);
        assert!(token.is_cancelled());

        files.clear_stop().expect("clear");
        assert!(!files.stop_requested());
    }

    #[test]
    fn watcher_cancels_a_running_token() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = ControlFiles::new(temp.path());
        let token = Arc::new(CancelToken::new());
        let watcher = files.clone().watch(token.clone());
        files.request_stop().expect("stop");
        for _ in 0..40 {
            if token.is_cancelled() {
                break;
            }
            thread::sleep(Duration::from_millis(50));
        }
        watcher.stop();
        assert!(token.is_cancelled());
    }
}
