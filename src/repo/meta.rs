use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key naming the node that owns a repo
pub const HOST_KEY: &str = "host";
/// Metadata key holding the owning node's RPC port
pub const RPC_PORT_KEY: &str = "port.rpc";

/// Flat string map attached to repos and queries
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(pub BTreeMap<String, String>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn host(&self) -> &str {
        self.get(HOST_KEY).unwrap_or("")
    }

    pub fn rpc_port(&self) -> Option<u16> {
        self.get(RPC_PORT_KEY).and_then(|p| p.trim().parse().ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of `self` with any key missing here filled in from `defaults`
    pub fn with_defaults(&self, defaults: &Meta) -> Meta {
        let mut merged = defaults.clone();
        for (k, v) in &self.0 {
            merged.0.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Parse `k=v` pairs, as given on the command line
    pub fn parse_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut meta = Meta::new();
        for pair in pairs {
            let (k, v) = pair
                .split_once('=')
                .ok_or_else(|| Error::validation("meta", format!("expected key=value, got {:?}", pair)))?;
            meta.insert(k.trim(), v.trim());
        }
        Ok(meta)
    }
}

impl FromIterator<(String, String)> for Meta {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Meta(iter.into_iter().collect())
    }
}

enum Cond {
    Exact(String),
    Regex { re: Regex, negate: bool },
    /// `!` with nothing after it
    Never,
}

impl Cond {
    fn matches(&self, value: &str) -> bool {
        match self {
            Cond::Exact(want) => want == value,
            Cond::Regex { re, negate } => re.is_match(value) != *negate,
            Cond::Never => false,
        }
    }
}

/// Compiled query-side metadata filter.
///
/// Every filter key must match; a key absent from the candidate compares
/// as the empty string. In regex mode values are unanchored patterns and a
/// leading `!` negates.
pub struct MetaFilter {
    conds: Vec<(String, Cond)>,
}

impl MetaFilter {
    pub fn new(filter: &Meta, regex: bool) -> Result<Self> {
        let mut conds = Vec::with_capacity(filter.0.len());
        for (key, value) in &filter.0 {
            let cond = if !regex {
                Cond::Exact(value.clone())
            } else {
                let (negate, pattern) = match value.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, value.as_str()),
                };
                if negate && pattern.is_empty() {
                    Cond::Never
                } else {
                    let re = Regex::new(pattern)
                        .map_err(|e| Error::validation(format!("meta.{}", key), e))?;
                    Cond::Regex { re, negate }
                }
            };
            conds.push((key.clone(), cond));
        }
        Ok(Self { conds })
    }

    pub fn matches(&self, meta: &Meta) -> bool {
        self.conds
            .iter()
            .all(|(key, cond)| cond.matches(meta.get(key).unwrap_or("")))
    }
}
