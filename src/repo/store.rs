use super::{Repo, RepoState};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Concurrent map of repos by key.
///
/// A single reader/writer lock guards the map. When opened with a backing
/// file, every successful mutation rewrites the whole store to disk while
/// the write lock is still held.
pub struct RepoStore {
    repos: RwLock<HashMap<String, Repo>>,
    path: Option<PathBuf>,
}

impl RepoStore {
    pub fn in_memory() -> Self {
        Self {
            repos: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Open a file-backed store, loading existing contents if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let repos = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))
                .map_err(|e| Error::Internal(format!("corrupt repo store {}: {}", path.display(), e)))?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), repos = repos.len(), "opened repo store");
        Ok(Self {
            repos: RwLock::new(repos),
            path: Some(path),
        })
    }

    pub fn get(&self, key: &str) -> Option<Repo> {
        self.read().get(key).cloned()
    }

    /// Insert or replace `key`; `None` deletes it
    pub fn set(&self, key: &str, repo: Option<Repo>) -> Result<()> {
        let mut repos = self.write();
        match repo {
            Some(repo) => {
                repos.insert(key.to_string(), repo);
            }
            None => {
                repos.remove(key);
            }
        }
        self.persist(&repos)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.set(key, None)
    }

    /// Update the state of an existing repo; a missing key is left alone
    pub fn set_state(&self, key: &str, state: RepoState) -> Result<()> {
        let mut repos = self.write();
        match repos.get_mut(key) {
            Some(repo) if repo.state != state => {
                repo.state = state;
                self.persist(&repos)
            }
            _ => Ok(()),
        }
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    /// Visit every repo under the read lock; return `false` to stop early
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Repo) -> bool,
    {
        let repos = self.read();
        for (key, repo) in repos.iter() {
            if !visit(key, repo) {
                break;
            }
        }
    }

    /// Snapshot of all repos sorted by key
    pub fn all(&self) -> Vec<Repo> {
        let mut out: Vec<Repo> = self.read().values().cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Repo>> {
        self.repos.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Repo>> {
        self.repos.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, repos: &HashMap<String, Repo>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, repos)
    }
}

fn write_atomic(path: &Path, repos: &HashMap<String, Repo>) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer(&mut writer, repos)
            .map_err(|e| Error::Internal(format!("failed to serialize repo store: {}", e)))?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
