use super::{ErrorMap, Update, merge_error, merge_errors, routed_result, routed_query};
use crate::error::{Error, ErrorPayload, Result};
use crate::repo::Meta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindQuery {
    /// Regex on the root-relative file name
    pub path_re: String,
    #[serde(default)]
    pub ignore_case: bool,
    #[serde(default)]
    pub repo_keys: Vec<String>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub meta_regexp_match: bool,
    /// Stop once this many matches are merged (0 = no limit)
    #[serde(default)]
    pub max_matches: u64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub recurse: bool,
}

routed_query!(FindQuery);

impl FindQuery {
    pub fn new(path_re: impl Into<String>) -> Self {
        Self {
            path_re: path_re.into(),
            ..Default::default()
        }
    }

    pub fn with_repos<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repo_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.path_re.is_empty() {
            return Err(Error::validation("path_re", "a path pattern is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindResult {
    /// file -> repo key -> match count
    #[serde(default)]
    pub matches: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    pub errors: ErrorMap,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub num_matches: u64,
    #[serde(default)]
    pub elapsed: Duration,
}

impl FindResult {
    pub fn add(&mut self, file: &str, repo: &str) {
        *self
            .matches
            .entry(file.to_string())
            .or_default()
            .entry(repo.to_string())
            .or_default() += 1;
        self.num_matches += 1;
    }
}

routed_result!(FindResult, |r| r.num_matches);

impl Update for FindResult {
    fn update(&mut self, other: Self) {
        for (file, repos) in other.matches {
            let slot = self.matches.entry(file).or_default();
            for (repo, count) in repos {
                *slot.entry(repo).or_default() += count;
            }
        }
        merge_errors(&mut self.errors, other.errors);
        merge_error(&mut self.error, other.error);
        self.num_matches += other.num_matches;
        self.elapsed = self.elapsed.max(other.elapsed);
    }
}
