//! Filesystem walker.
//!
//! Lazily enumerates candidate entries under a set of roots. Depth-first
//! with an explicit work stack; directory entries are visited in sorted
//! name order so the sequence is stable per (root, filesystem state) and
//! scan checkpoints define a meaningful watermark.
//!
//! Per-entry failures (permission, stat, symlink cycles) are emitted
//! inline and never abort the sequence; a missing root ends the sequence
//! for that root only.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{CandidateEntry, EntryStat, RootId};

/// Walker configuration.
#[derive(Debug, Clone, Default)]
pub struct WalkerOptions {
    /// Ignore globs matched against the relative path; a match excludes
    /// the entry (and stops descent for directories).
    pub ignore: Vec<String>,
    pub follow_symlinks: bool,
    /// When false, descent skips directories on a different device than
    /// their root.
    pub cross_device: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkErrorKind {
    AccessDenied,
    StatFailed,
    SymlinkCycle,
    RootMissing,
}

/// A non-fatal per-entry failure, emitted inline.
#[derive(Debug, Clone)]
pub struct WalkError {
    pub path: PathBuf,
    pub kind: WalkErrorKind,
    pub detail: String,
}

#[derive(Debug)]
pub enum WalkItem {
    Entry(CandidateEntry),
    Error(WalkError),
}

/// Compare two relative paths in traversal order.
///
/// The walker emits sorted path *components*, which is not the same as
/// lexicographic order on the joined string (`a/c` precedes `a-b` in
/// traversal although `a-b` < `a/c` bytewise). Checkpoint watermarks must
/// use this ordering.
pub fn traversal_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.split('/');
    let mut right = b.split('/');
    loop {
        match (left.next(), right.next()) {
            (Some(x), Some(y)) => match x.cmp(y) {
                Ordering::Equal => {}
                other => return other,
            },
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (None, None) => return Ordering::Equal,
        }
    }
}

struct Frame {
    absolute: PathBuf,
    relative: String,
    depth: usize,
}

struct RootWalk {
    root_id: RootId,
    root_device: u64,
    stack: Vec<Frame>,
    /// `(device, inode)` of every directory on the current path, used to
    /// detect symlink loops.
    ancestors: Vec<(u64, u64)>,
}

/// Lazy walker over one or more roots.
pub struct Walker {
    ignore: GlobSet,
    follow_symlinks: bool,
    cross_device: bool,
    roots: VecDeque<(RootId, PathBuf)>,
    current: Option<RootWalk>,
}

impl Walker {
    pub fn new(roots: Vec<(RootId, PathBuf)>, options: &WalkerOptions) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &options.ignore {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::InvalidInput(format!("bad ignore glob {pattern:?}: {e}")))?;
            builder.add(glob);
        }
        let ignore = builder
            .build()
            .map_err(|e| Error::InvalidInput(format!("bad ignore set: {e}")))?;

        Ok(Self {
            ignore,
            follow_symlinks: options.follow_symlinks,
            cross_device: options.cross_device,
            roots: roots.into_iter().collect(),
            current: None,
        })
    }

    fn stat(&self, path: &Path) -> std::io::Result<fs::Metadata> {
        if self.follow_symlinks {
            fs::metadata(path)
        } else {
            fs::symlink_metadata(path)
        }
    }

    fn begin_root(&mut self, root_id: RootId, root_path: &Path) -> Option<WalkItem> {
        let meta = match self.stat(root_path) {
            Ok(meta) => meta,
            Err(e) => {
                return Some(WalkItem::Error(WalkError {
                    path: root_path.to_path_buf(),
                    kind: WalkErrorKind::RootMissing,
                    detail: e.to_string(),
                }));
            }
        };

        if meta.is_file() {
            // A root that is a regular file yields itself as the sole entry.
            let relative = root_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            return Some(WalkItem::Entry(candidate(
                root_id,
                root_path.to_path_buf(),
                relative,
                &meta,
            )));
        }

        debug!("Walking root {} at {}", root_id, root_path.display());
        self.current = Some(RootWalk {
            root_id,
            root_device: meta.dev(),
            stack: vec![Frame {
                absolute: root_path.to_path_buf(),
                relative: String::new(),
                depth: 0,
            }],
            ancestors: Vec::new(),
        });
        None
    }

    /// Process one frame of the current root. `None` means the frame
    /// produced nothing visible (descent, skip); the caller loops.
    fn step(&mut self) -> Option<Option<WalkItem>> {
        let walk = self.current.as_mut()?;
        let root_id = walk.root_id;
        let root_device = walk.root_device;
        let Some(frame) = walk.stack.pop() else {
            self.current = None;
            return Some(None);
        };

        walk.ancestors.truncate(frame.depth);

        let stat_result = if self.follow_symlinks {
            fs::metadata(&frame.absolute)
        } else {
            fs::symlink_metadata(&frame.absolute)
        };
        let meta = match stat_result {
            Ok(meta) => meta,
            Err(e) => {
                let kind = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => WalkErrorKind::AccessDenied,
                    _ => WalkErrorKind::StatFailed,
                };
                return Some(Some(WalkItem::Error(WalkError {
                    path: frame.absolute,
                    kind,
                    detail: e.to_string(),
                })));
            }
        };

        if meta.is_file() {
            if !frame.relative.is_empty() && self.ignore.is_match(&frame.relative) {
                return Some(None);
            }
            return Some(Some(WalkItem::Entry(candidate(
                root_id,
                frame.absolute,
                frame.relative,
                &meta,
            ))));
        }

        if !meta.is_dir() {
            // Symlinks (when not followed), sockets, fifos: not candidates.
            return Some(None);
        }

        if !frame.relative.is_empty() && self.ignore.is_match(&frame.relative) {
            return Some(None);
        }

        if !self.cross_device && meta.dev() != root_device {
            debug!(
                "Skipping {} (device {} != root device {})",
                frame.absolute.display(),
                meta.dev(),
                root_device
            );
            return Some(None);
        }

        let key = (meta.dev(), meta.ino());
        if walk.ancestors.contains(&key) {
            return Some(Some(WalkItem::Error(WalkError {
                path: frame.absolute,
                kind: WalkErrorKind::SymlinkCycle,
                detail: format!("directory (dev={}, ino={}) already on path", key.0, key.1),
            })));
        }

        let entries = match fs::read_dir(&frame.absolute) {
            Ok(iter) => iter,
            Err(e) => {
                let kind = match e.kind() {
                    std::io::ErrorKind::PermissionDenied => WalkErrorKind::AccessDenied,
                    _ => WalkErrorKind::StatFailed,
                };
                return Some(Some(WalkItem::Error(WalkError {
                    path: frame.absolute,
                    kind,
                    detail: e.to_string(),
                })));
            }
        };

        let mut names: Vec<std::ffi::OsString> = entries
            .filter_map(|entry| entry.ok().map(|e| e.file_name()))
            .collect();
        // Sorted descending: the stack pops in ascending name order.
        names.sort_unstable_by(|a, b| b.cmp(a));

        walk.ancestors.push(key);
        let depth = frame.depth + 1;
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            let relative = if frame.relative.is_empty() {
                name_str
            } else {
                format!("{}/{}", frame.relative, name_str)
            };
            walk.stack.push(Frame {
                absolute: frame.absolute.join(&name),
                relative,
                depth,
            });
        }

        Some(None)
    }
}

fn candidate(
    root_id: RootId,
    absolute_path: PathBuf,
    relative_path: String,
    meta: &fs::Metadata,
) -> CandidateEntry {
    CandidateEntry {
        absolute_path,
        relative_path,
        root_id,
        stat: EntryStat {
            size: meta.len(),
            mtime_ns: meta.mtime().saturating_mul(1_000_000_000) + meta.mtime_nsec(),
            inode: meta.ino(),
            device: meta.dev(),
            mode: meta.mode(),
        },
    }
}

impl Iterator for Walker {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            if self.current.is_some() {
                match self.step() {
                    Some(Some(item)) => return Some(item),
                    Some(None) => continue,
                    None => return None,
                }
            }

            let (root_id, root_path) = self.roots.pop_front()?;
            if let Some(item) = self.begin_root(root_id, &root_path) {
                return Some(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap().write_all(content).unwrap();
    }

    fn collect_paths(walker: Walker) -> Vec<String> {
        walker
            .filter_map(|item| match item {
                WalkItem::Entry(e) => Some(e.relative_path),
                WalkItem::Error(_) => None,
            })
            .collect()
    }

    #[test]
    fn emits_entries_in_sorted_component_order() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("b.txt"), b"b");
        write_file(&dir.path().join("a/c.txt"), b"c");
        write_file(&dir.path().join("a-b.txt"), b"ab");

        let walker = Walker::new(
            vec![(1, dir.path().to_path_buf())],
            &WalkerOptions::default(),
        )
        .unwrap();
        let paths = collect_paths(walker);

        // "a/c.txt" precedes "a-b.txt": component order, not string order.
        assert_eq!(paths, vec!["a/c.txt", "a-b.txt", "b.txt"]);
    }

    #[test]
    fn order_is_stable_across_walks() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["z", "m/x", "m/a", "a"] {
            write_file(&dir.path().join(name), b"x");
        }

        let walk = |options: &WalkerOptions| {
            collect_paths(Walker::new(vec![(1, dir.path().to_path_buf())], options).unwrap())
        };
        let options = WalkerOptions::default();
        assert_eq!(walk(&options), walk(&options));
    }

    #[test]
    fn ignore_patterns_exclude_entries_and_subtrees() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("keep.txt"), b"k");
        write_file(&dir.path().join("skip.tmp"), b"s");
        write_file(&dir.path().join("cache/deep/file.txt"), b"f");

        let options = WalkerOptions {
            ignore: vec!["*.tmp".into(), "cache".into()],
            ..WalkerOptions::default()
        };
        let walker = Walker::new(vec![(1, dir.path().to_path_buf())], &options).unwrap();
        assert_eq!(collect_paths(walker), vec!["keep.txt"]);
    }

    #[test]
    fn missing_root_is_fatal_for_that_root_only() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("f"), b"x");

        let walker = Walker::new(
            vec![
                (1, PathBuf::from("/nonexistent-nodupe-root")),
                (2, dir.path().to_path_buf()),
            ],
            &WalkerOptions::default(),
        )
        .unwrap();

        let items: Vec<WalkItem> = walker.collect();
        assert!(matches!(
            &items[0],
            WalkItem::Error(WalkError {
                kind: WalkErrorKind::RootMissing,
                ..
            })
        ));
        assert!(matches!(&items[1], WalkItem::Entry(e) if e.root_id == 2));
    }

    #[test]
    fn symlink_cycle_is_reported_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("sub/f.txt"), b"x");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();

        let options = WalkerOptions {
            follow_symlinks: true,
            ..WalkerOptions::default()
        };
        let walker = Walker::new(vec![(1, dir.path().to_path_buf())], &options).unwrap();
        let items: Vec<WalkItem> = walker.collect();

        let cycles = items
            .iter()
            .filter(
                |i| matches!(i, WalkItem::Error(e) if e.kind == WalkErrorKind::SymlinkCycle),
            )
            .count();
        let entries = items
            .iter()
            .filter(|i| matches!(i, WalkItem::Entry(_)))
            .count();
        assert_eq!(cycles, 1);
        assert_eq!(entries, 1);
    }

    #[test]
    fn unfollowed_symlinks_are_not_candidates() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir.path().join("real.txt"), b"x");
        std::os::unix::fs::symlink(
            dir.path().join("real.txt"),
            dir.path().join("alias.txt"),
        )
        .unwrap();

        let walker = Walker::new(
            vec![(1, dir.path().to_path_buf())],
            &WalkerOptions::default(),
        )
        .unwrap();
        assert_eq!(collect_paths(walker), vec!["real.txt"]);
    }

    #[test]
    fn traversal_cmp_orders_components() {
        assert_eq!(traversal_cmp("a/c", "a-b"), Ordering::Less);
        assert_eq!(traversal_cmp("a", "a/c"), Ordering::Less);
        assert_eq!(traversal_cmp("b", "a/c"), Ordering::Greater);
        assert_eq!(traversal_cmp("a/c", "a/c"), Ordering::Equal);
    }
}
