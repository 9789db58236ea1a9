//! Derive a trigram pre-filter from a content regex.
//!
//! The query is a necessary condition: any file containing a match holds
//! every trigram the query requires. Anything the planner cannot reason
//! about widens to [`TrigramQuery::All`].

use crate::error::{Error, Result};
use crate::utils::{Trigram, bytes_to_trigram, fold_char};
use regex_syntax::ParserBuilder;
use regex_syntax::hir::{Class, Hir, HirKind};

/// Case-fold classes with more code points than this are never collapsed
const MAX_FOLD_CLASS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrigramQuery {
    /// No constraint; every file is a candidate
    All,
    /// Every trigram must be present
    And(Vec<Trigram>),
    /// Every sub-query must hold
    Every(Vec<TrigramQuery>),
    /// At least one sub-query must hold
    Or(Vec<TrigramQuery>),
}

impl TrigramQuery {
    pub fn is_all(&self) -> bool {
        matches!(self, TrigramQuery::All)
    }

    /// Conjunction of `parts`, flattened and with `All` dropped
    fn every(parts: Vec<TrigramQuery>) -> TrigramQuery {
        let mut trigrams = Vec::new();
        let mut rest = Vec::new();
        for part in parts {
            match part {
                TrigramQuery::All => {}
                TrigramQuery::And(t) => trigrams.extend(t),
                TrigramQuery::Every(subs) => rest.extend(subs),
                or @ TrigramQuery::Or(_) => rest.push(or),
            }
        }
        trigrams.sort_unstable();
        trigrams.dedup();

        if !trigrams.is_empty() {
            rest.insert(0, TrigramQuery::And(trigrams));
        }
        match rest.len() {
            0 => TrigramQuery::All,
            1 => rest.remove(0),
            _ => TrigramQuery::Every(rest),
        }
    }

    /// Disjunction of `alts`; any unconstrained branch makes the whole thing `All`
    fn any(alts: Vec<TrigramQuery>) -> TrigramQuery {
        if alts.is_empty() || alts.iter().any(TrigramQuery::is_all) {
            return TrigramQuery::All;
        }
        let mut alts = alts;
        if alts.len() == 1 {
            return alts.remove(0);
        }
        TrigramQuery::Or(alts)
    }
}

/// Plan the pre-filter for `pattern`, as the line matcher will compile it
pub fn plan(pattern: &str, ignore_case: bool) -> Result<TrigramQuery> {
    let hir = ParserBuilder::new()
        .utf8(false)
        .multi_line(true)
        .case_insensitive(ignore_case)
        .build()
        .parse(pattern)
        .map_err(|e| Error::validation("re", e))?;
    Ok(from_hir(&hir))
}

/// One byte of a contiguous literal run; `folded` if it came from a case-fold class
#[derive(Clone, Copy)]
struct RunByte {
    byte: u8,
    folded: bool,
}

#[derive(Default)]
struct Run {
    bytes: Vec<RunByte>,
    out: Vec<Trigram>,
}

impl Run {
    fn push_literal(&mut self, lit: &[u8]) {
        self.bytes
            .extend(lit.iter().map(|&byte| RunByte { byte, folded: false }));
    }

    fn push_folded(&mut self, byte: u8) {
        self.bytes.push(RunByte { byte, folded: true });
    }

    /// Emit trigrams for the bytes gathered so far and start a new run
    fn flush(&mut self) {
        for w in self.bytes.windows(3) {
            if w.iter().any(|b| b.folded) {
                // a mixed window is looked up in the folded view, where only
                // ASCII bytes are guaranteed to be rewritten consistently
                if w.iter().any(|b| !b.byte.is_ascii()) {
                    continue;
                }
                self.out.push(bytes_to_trigram(
                    w[0].byte.to_ascii_lowercase(),
                    w[1].byte.to_ascii_lowercase(),
                    w[2].byte.to_ascii_lowercase(),
                ));
            } else {
                self.out.push(bytes_to_trigram(w[0].byte, w[1].byte, w[2].byte));
            }
        }
        self.bytes.clear();
    }

    fn finish(mut self) -> TrigramQuery {
        self.flush();
        self.out.sort_unstable();
        self.out.dedup();
        if self.out.is_empty() {
            TrigramQuery::All
        } else {
            TrigramQuery::And(self.out)
        }
    }
}

fn from_hir(hir: &Hir) -> TrigramQuery {
    match hir.kind() {
        HirKind::Literal(lit) => {
            let mut run = Run::default();
            run.push_literal(&lit.0);
            run.finish()
        }
        HirKind::Concat(subs) => from_concat(subs),
        HirKind::Alternation(alts) => TrigramQuery::any(alts.iter().map(from_hir).collect()),
        HirKind::Repetition(rep) if rep.min >= 1 => from_hir(&rep.sub),
        HirKind::Capture(cap) => from_hir(&cap.sub),
        _ => TrigramQuery::All,
    }
}

fn from_concat(subs: &[Hir]) -> TrigramQuery {
    let mut run = Run::default();
    let mut parts = Vec::new();

    for sub in subs {
        match sub.kind() {
            HirKind::Literal(lit) => run.push_literal(&lit.0),
            // zero-width items do not separate the bytes around them
            HirKind::Look(_) | HirKind::Empty => {}
            HirKind::Class(class) => match folded_byte(class) {
                Some(byte) => run.push_folded(byte),
                None => run.flush(),
            },
            _ => {
                run.flush();
                parts.push(from_hir(sub));
            }
        }
    }

    parts.push(run.finish());
    TrigramQuery::every(parts)
}

/// The single ASCII byte every member of `class` folds to, if there is one
fn folded_byte(class: &Class) -> Option<u8> {
    let mut members: Vec<char> = Vec::new();
    match class {
        Class::Unicode(cls) => {
            for range in cls.ranges() {
                for c in range.start()..=range.end() {
                    if members.len() == MAX_FOLD_CLASS {
                        return None;
                    }
                    members.push(c);
                }
            }
        }
        Class::Bytes(cls) => {
            for range in cls.ranges() {
                for b in range.start()..=range.end() {
                    if members.len() == MAX_FOLD_CLASS {
                        return None;
                    }
                    members.push(char::from(b));
                }
            }
        }
    }

    let first = fold_char(*members.first()?);
    if !first.is_ascii() || members.len() < 2 {
        return None;
    }
    members
        .iter()
        .all(|&c| fold_char(c) == first)
        .then_some(first as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tri(s: &str) -> Trigram {
        let b = s.as_bytes();
        bytes_to_trigram(b[0], b[1], b[2])
    }

    fn and(grams: &[&str]) -> TrigramQuery {
        let mut t: Vec<Trigram> = grams.iter().map(|g| tri(g)).collect();
        t.sort_unstable();
        t.dedup();
        TrigramQuery::And(t)
    }

    #[test]
    fn test_literal() {
        assert_eq!(plan("hello", false).unwrap(), and(&["hel", "ell", "llo"]));
    }

    #[test]
    fn test_short_literal_is_all() {
        assert!(plan("hi", false).unwrap().is_all());
    }

    #[test]
    fn test_ignore_case_folds() {
        assert_eq!(plan("HeLLo", true).unwrap(), and(&["hel", "ell", "llo"]));
        assert_eq!(plan("(?i)abc", false).unwrap(), and(&["abc"]));
    }

    #[test]
    fn test_mixed_case_window_is_folded() {
        // "Ab" literal next to a fold class: the trigram lives in the folded view
        assert_eq!(plan("Ab(?i:c)", false).unwrap(), and(&["abc"]));
    }

    #[test]
    fn test_wildcard_splits_runs() {
        assert_eq!(plan("foo.*bar", false).unwrap(), and(&["foo", "bar"]));
    }

    #[test]
    fn test_anchors_keep_run() {
        assert_eq!(plan("^abc$", false).unwrap(), and(&["abc"]));
    }

    #[test]
    fn test_alternation() {
        let q = plan("hello|world", false).unwrap();
        assert_eq!(
            q,
            TrigramQuery::Or(vec![
                and(&["hel", "ell", "llo"]),
                and(&["wor", "orl", "rld"])
            ])
        );
        assert!(plan("hello|x", false).unwrap().is_all());
    }

    #[test]
    fn test_optional_repetition_is_all() {
        assert!(plan("(abc)?", false).unwrap().is_all());
        assert_eq!(plan("(abc)+", false).unwrap(), and(&["abc"]));
    }

    #[test]
    fn test_nested_alternation_in_concat() {
        let q = plan("abc(def|ghi)", false).unwrap();
        assert_eq!(
            q,
            TrigramQuery::Every(vec![
                and(&["abc"]),
                TrigramQuery::Or(vec![and(&["def"]), and(&["ghi"])]),
            ])
        );
    }

    #[test]
    fn test_wide_class_is_all() {
        assert!(plan("[a-z]+", false).unwrap().is_all());
    }

    #[test]
    fn test_invalid_regex() {
        assert!(plan("(", false).is_err());
    }
}
