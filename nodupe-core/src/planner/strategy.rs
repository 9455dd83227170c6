//! Keeper-selection strategies.
//!
//! Every strategy is deterministic: ties always break on ascending
//! `file_id`, so identical catalogs produce identical keepers.

use std::path::PathBuf;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::json;

use crate::error::{Error, Result};
use crate::types::{FileId, FileRecord, RootId, StrategyDescriptor};

/// A class member with its resolved absolute path.
#[derive(Debug, Clone)]
pub struct ClassMember {
    pub record: FileRecord,
    pub absolute_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum Strategy {
    KeepOldestMtime,
    KeepNewestMtime,
    KeepShortestPath,
    KeepLongestPath,
    KeepFirstRootInConfigOrder,
    KeepByPathPattern { priority_globs: Vec<String> },
}

impl Strategy {
    /// Parse a strategy descriptor. Unknown names are invalid input
    /// (exit 2 at the CLI).
    pub fn parse(name: &str, params: &serde_json::Value) -> Result<Self> {
        match name {
            "keep_oldest_mtime" => Ok(Strategy::KeepOldestMtime),
            "keep_newest_mtime" => Ok(Strategy::KeepNewestMtime),
            "keep_shortest_path" => Ok(Strategy::KeepShortestPath),
            "keep_longest_path" => Ok(Strategy::KeepLongestPath),
            "keep_first_root_in_config_order" => Ok(Strategy::KeepFirstRootInConfigOrder),
            "keep_by_path_pattern" => {
                let globs: Vec<String> = params
                    .get("priority_globs")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .ok_or_else(|| {
                        Error::InvalidInput(
                            "keep_by_path_pattern requires params.priority_globs".into(),
                        )
                    })?;
                if globs.is_empty() {
                    return Err(Error::InvalidInput(
                        "keep_by_path_pattern requires at least one glob".into(),
                    ));
                }
                Ok(Strategy::KeepByPathPattern {
                    priority_globs: globs,
                })
            }
            other => Err(Error::InvalidInput(format!("unknown strategy: {other}"))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::KeepOldestMtime => "keep_oldest_mtime",
            Strategy::KeepNewestMtime => "keep_newest_mtime",
            Strategy::KeepShortestPath => "keep_shortest_path",
            Strategy::KeepLongestPath => "keep_longest_path",
            Strategy::KeepFirstRootInConfigOrder => "keep_first_root_in_config_order",
            Strategy::KeepByPathPattern { .. } => "keep_by_path_pattern",
        }
    }

    pub fn descriptor(&self) -> StrategyDescriptor {
        let params = match self {
            Strategy::KeepByPathPattern { priority_globs } => {
                json!({ "priority_globs": priority_globs })
            }
            _ => json!({}),
        };
        StrategyDescriptor {
            name: self.name().to_string(),
            params,
        }
    }

    /// Pick exactly one keeper from a non-empty class.
    ///
    /// `root_order` is the configured scope order, used by
    /// `keep_first_root_in_config_order`.
    pub fn pick_keeper(&self, members: &[ClassMember], root_order: &[RootId]) -> Result<FileId> {
        if members.is_empty() {
            return Err(Error::Internal("empty duplicate class".into()));
        }

        let chosen = match self {
            Strategy::KeepOldestMtime => pick(members, |m| m.record.mtime_ns),
            Strategy::KeepNewestMtime => pick(members, |m| -m.record.mtime_ns),
            Strategy::KeepShortestPath => {
                pick(members, |m| m.absolute_path.as_os_str().len() as i64)
            }
            Strategy::KeepLongestPath => {
                pick(members, |m| -(m.absolute_path.as_os_str().len() as i64))
            }
            Strategy::KeepFirstRootInConfigOrder => pick(members, |m| {
                root_order
                    .iter()
                    .position(|r| *r == m.record.root_id)
                    .map_or(i64::MAX, |p| p as i64)
            }),
            Strategy::KeepByPathPattern { priority_globs } => {
                let sets = build_priority_sets(priority_globs)?;
                pick(members, |m| {
                    sets.iter()
                        .position(|set| {
                            set.is_match(&m.record.relative_path)
                                || set.is_match(&m.absolute_path)
                        })
                        .map_or(i64::MAX, |p| p as i64)
                })
            }
        };
        Ok(chosen)
    }
}

/// Lowest key wins, ties break on ascending file id.
fn pick(members: &[ClassMember], key: impl Fn(&ClassMember) -> i64) -> FileId {
    let mut best = &members[0];
    let mut best_key = key(best);
    for member in &members[1..] {
        let k = key(member);
        if k < best_key || (k == best_key && member.record.file_id < best.record.file_id) {
            best = member;
            best_key = k;
        }
    }
    best.record.file_id
}

fn build_priority_sets(globs: &[String]) -> Result<Vec<GlobSet>> {
    globs
        .iter()
        .map(|pattern| {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::InvalidInput(format!("bad priority glob {pattern:?}: {e}")))?;
            let mut builder = GlobSetBuilder::new();
            builder.add(glob);
            builder
                .build()
                .map_err(|e| Error::InvalidInput(format!("bad priority glob {pattern:?}: {e}")))
        })
        .collect()
}
