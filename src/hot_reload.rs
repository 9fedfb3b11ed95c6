// Config hot reload
//
// Watches the directory holding config.toml (editors often replace the file
// rather than write it in place) and flags a change the render loop picks up
// on its next iteration.

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ConfigWatcher {
    path: PathBuf,
    changed: Arc<Mutex<bool>>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file_name: OsString = path
            .file_name()
            .context("Config path has no file name")?
            .to_os_string();
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let changed = Arc::new(Mutex::new(false));
        let flag = changed.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if is_config_change(&event, &file_name) {
                        *flag.lock() = true;
                    }
                }
                Err(e) => log::warn!("Config watch error: {}", e),
            }
        })
        .context("Failed to create config file watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;

        log::info!("Watching {:?} for changes", path);
        Ok(Self {
            path,
            changed,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the file changed since the last call
    pub fn take_changed(&self) -> bool {
        std::mem::take(&mut *self.changed.lock())
    }
}

fn is_config_change(event: &notify::Event, file_name: &OsString) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_)
    ) && event
        .paths
        .iter()
        .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
