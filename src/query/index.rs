use super::{ErrorMap, Update, merge_error, merge_errors, routed_result};
use crate::error::{Error, ErrorPayload, Result};
use crate::repo::{Meta, Repo};
use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub key: String,
    /// Absolute source root
    pub root: PathBuf,
    /// Sub-directories of `root` to index, relative
    pub dirs: Vec<PathBuf>,
    /// Metadata recorded on the repo; `host` selects the owning node
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Set only by the node that accepts the query from outside the mesh
    #[serde(default)]
    pub recurse: bool,
}

impl IndexQuery {
    pub fn new(key: impl Into<String>, root: impl Into<PathBuf>, dirs: Vec<PathBuf>) -> Self {
        Self {
            key: key.into(),
            root: root.into(),
            dirs,
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Reject malformed queries before anything is stored
    pub fn validate(&self) -> Result<()> {
        let mut components = std::path::Path::new(&self.key).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return Err(Error::validation("key", "must be a single non-empty path component")),
        }
        if self.dirs.is_empty() {
            return Err(Error::validation("dirs", "at least one directory is required"));
        }
        if !self.root.is_absolute() {
            return Err(Error::validation(
                "root",
                format!("{} is not an absolute path", self.root.display()),
            ));
        }
        if let Some(dir) = self.dirs.iter().find(|d| d.is_absolute()) {
            return Err(Error::validation(
                "dirs",
                format!("{} is not a relative path", dir.display()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResult {
    #[serde(default)]
    pub repo: Option<Repo>,
    #[serde(default)]
    pub errors: ErrorMap,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub elapsed: Duration,
}

/// Ordering used to pick one repo when two results both carry one.
/// Ties on the preferred fields fall back to the whole record.
fn repo_rank(repo: &Repo) -> (u64, &str, u64, u64, u64, &Repo) {
    (
        repo.time_updated,
        repo.key.as_str(),
        repo.num_files,
        repo.num_dirs,
        repo.size_index,
        repo,
    )
}

routed_result!(IndexResult, |_| 0);

impl Update for IndexResult {
    fn update(&mut self, other: Self) {
        if let Some(theirs) = other.repo {
            let replace = match &self.repo {
                Some(ours) => repo_rank(&theirs) > repo_rank(ours),
                None => true,
            };
            if replace {
                self.repo = Some(theirs);
            }
        }
        merge_errors(&mut self.errors, other.errors);
        merge_error(&mut self.error, other.error);
        self.elapsed = self.elapsed.max(other.elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::repo::RepoState;

    fn valid() -> IndexQuery {
        IndexQuery::new("r1", "/src/r1", vec![PathBuf::from("lib")])
    }

    #[test]
    fn test_update_picks_same_repo_either_way() {
        let ok = Repo {
            state: RepoState::Ok,
            ..Repo::new("r1", "/src/r1", Meta::new())
        };
        let failed = Repo {
            state: RepoState::Error,
            ..ok.clone()
        };
        let a = IndexResult {
            repo: Some(ok),
            ..Default::default()
        };
        let b = IndexResult {
            repo: Some(failed),
            ..Default::default()
        };

        let mut ab = a.clone();
        ab.update(b.clone());
        let mut ba = b;
        ba.update(a);
        assert_eq!(ab, ba);
        assert_eq!(ab.repo.unwrap().state, RepoState::Error);
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let cases = [
            IndexQuery { dirs: vec![], ..valid() },
            IndexQuery { root: PathBuf::from("rel"), ..valid() },
            IndexQuery { dirs: vec![PathBuf::from("/abs")], ..valid() },
            IndexQuery { key: String::new(), ..valid() },
            IndexQuery { key: "a/b".to_string(), ..valid() },
            IndexQuery { key: "..".to_string(), ..valid() },
        ];
        for query in cases {
            let err = query.validate().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{query:?}");
        }
    }
}
