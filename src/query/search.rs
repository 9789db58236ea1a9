use super::{ErrorMap, Update, merge_error, merge_errors, routed_result, routed_query};
use crate::error::{Error, ErrorPayload, Result};
use crate::repo::Meta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Line number to line text, for one file in one repo
pub type LineMatches = BTreeMap<u64, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Content regex
    pub re: String,
    /// Optional regex on the root-relative file name
    #[serde(default)]
    pub path_re: Option<String>,
    #[serde(default)]
    pub ignore_case: bool,
    /// Explicit repos; when empty, repos are selected by `meta`
    #[serde(default)]
    pub repo_keys: Vec<String>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(default)]
    pub meta_regexp_match: bool,
    /// Lines of context on both sides
    #[serde(default)]
    pub context: usize,
    #[serde(default)]
    pub before: usize,
    #[serde(default)]
    pub after: usize,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub recurse: bool,
}

routed_query!(SearchQuery);

impl SearchQuery {
    pub fn new(re: impl Into<String>) -> Self {
        Self {
            re: re.into(),
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

    /// Effective pre-context line count
    pub fn lines_before(&self) -> usize {
        self.context.max(self.before)
    }

    /// Effective post-context line count
    pub fn lines_after(&self) -> usize {
        self.context.max(self.after)
    }

    pub fn validate(&self) -> Result<()> {
        if self.re.is_empty() {
            return Err(Error::validation("re", "a content pattern is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// file -> repo key -> line number -> line
    #[serde(default)]
    pub matches: BTreeMap<String, BTreeMap<String, LineMatches>>,
    #[serde(default)]
    pub errors: ErrorMap,
    #[serde(default)]
    pub error: Option<ErrorPayload>,
    #[serde(default)]
    pub num_matches: u64,
    #[serde(default)]
    pub elapsed: Duration,
    /// Time spent in posting queries, summed over shards
    #[serde(default)]
    pub elapsed_posting: Duration,
}

impl SearchResult {
    pub fn add_lines(&mut self, file: &str, repo: &str, lines: LineMatches) {
        if lines.is_empty() {
            return;
        }
        let slot = self
            .matches
            .entry(file.to_string())
            .or_default()
            .entry(repo.to_string())
            .or_default();
        merge_lines(slot, lines);
    }
}

fn merge_lines(into: &mut LineMatches, other: LineMatches) {
    for (n, line) in other {
        match into.get_mut(&n) {
            Some(existing) if *existing >= line => {}
            Some(existing) => *existing = line,
            None => {
                into.insert(n, line);
            }
        }
    }
}

routed_result!(SearchResult, |r| r.num_matches);

impl Update for SearchResult {
    fn update(&mut self, other: Self) {
        for (file, repos) in other.matches {
            let slot = self.matches.entry(file).or_default();
            for (repo, lines) in repos {
                merge_lines(slot.entry(repo).or_default(), lines);
            }
        }
        merge_errors(&mut self.errors, other.errors);
        merge_error(&mut self.error, other.error);
        self.num_matches += other.num_matches;
        self.elapsed = self.elapsed.max(other.elapsed);
        self.elapsed_posting += other.elapsed_posting;
    }
}
