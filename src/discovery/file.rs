//! File-backed registry with hot reload.
//!
//! The file lists instances as TOML:
//!
//! ```toml
//! [[instance]]
//! service = "stringsvc"
//! address = "127.0.0.1:8081"
//! tags = ["prod"]
//! health = "passing"
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tokio::sync::watch;

use crate::discovery::instance::Instance;
use crate::discovery::registry::{Query, Registry};
use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct InstanceFile {
    #[serde(default)]
    instance: Vec<Instance>,
}

/// A registry reading instances from a TOML file.
pub struct FileRegistry {
    path: PathBuf,
    index: Arc<watch::Sender<u64>>,
    _watcher: Mutex<RecommendedWatcher>,
}

impl FileRegistry {
    /// Open `path` and start watching it for changes.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (index, _) = watch::channel(0);
        let index = Arc::new(index);
        let watcher = start_watcher(&path, index.clone())?;
        Ok(Self {
            path,
            index,
            _watcher: Mutex::new(watcher),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// The parent directory is watched so editors that replace the file
// (write + rename) are still noticed.
fn start_watcher(path: &Path, tx: Arc<watch::Sender<u64>>) -> Result<RecommendedWatcher> {
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let ours = event
                    .paths
                    .iter()
                    .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if ours && !event.kind.is_access() {
                    tracing::info!("Instance file change detected");
                    tx.send_modify(|i| *i += 1);
                }
            }
            Err(e) => tracing::error!("Watch error: {:?}", e),
        },
        Config::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Discovery(e.to_string()))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Discovery(e.to_string()))?;

    tracing::info!(path = ?path, "Instance file watcher started");
    Ok(watcher)
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Registry for FileRegistry {
    fn list<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Vec<Instance>>> {
        async move {
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| Error::Discovery(format!("{}: {e}", self.path.display())))?;
            let file: InstanceFile = toml::from_str(&content)
                .map_err(|e| Error::Discovery(format!("{}: {e}", self.path.display())))?;
            Ok(file.instance.into_iter().filter(|i| query.matches(i)).collect())
        }
        .boxed()
    }

    fn watch(&self, _service: &str) -> Result<watch::Receiver<u64>> {
        Ok(self.index.subscribe())
    }
}
