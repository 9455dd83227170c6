//! Duplicate-resolution planner.
//!
//! Groups catalog rows into duplicate classes, applies a strategy to pick
//! exactly one keeper per class, and emits a totally ordered, validated
//! plan. Planning is side-effect-free and deterministic: the same
//! (catalog epoch, strategy, constraints) yields a byte-identical plan,
//! including its id.

pub mod artifact;
pub mod strategy;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::hash::HashAlgo;
use crate::similarity::{BruteForceIndex, SimilarityBackend};
use crate::types::{
    Action, ClassKey, Constraints, FileId, FileRecord, LinkKind, Plan, PlanAction, RootId,
};

pub use strategy::{ClassMember, Strategy};

/// Planner inputs beyond the catalog itself.
pub struct PlannerOptions {
    pub strategy: Strategy,
    pub constraints: Constraints,
    /// When set, similarity clusters at this threshold augment the
    /// content classes.
    pub similarity_threshold: Option<f32>,
}

/// Deterministic duplicate-resolution engine.
pub struct Planner<'a> {
    catalog: &'a dyn Catalog,
}

struct ResolvedClass {
    key: ClassKey,
    members: Vec<ClassMember>,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a dyn Catalog) -> Self {
        Self { catalog }
    }

    /// Build a plan bound to the current catalog epoch.
    pub fn build_plan(&self, options: &PlannerOptions) -> Result<Plan> {
        let epoch = self.catalog.epoch()?;
        let root_paths: HashMap<RootId, PathBuf> =
            self.catalog.list_roots()?.into_iter().collect();
        let scope = &options.constraints.scope_root_ids;

        let must_keep = build_globset(&options.constraints.must_keep, "must-keep")?;
        let must_not_delete =
            build_globset(&options.constraints.must_not_delete, "must-not-delete")?;

        let mut classes = self.content_classes(scope, &root_paths)?;
        let mut consumed: HashSet<FileId> = classes
            .iter()
            .flat_map(|c| c.members.iter().map(|m| m.record.file_id))
            .collect();
        if let Some(threshold) = options.similarity_threshold {
            classes.extend(self.similarity_classes(
                threshold,
                scope,
                &root_paths,
                &mut consumed,
            )?);
        }

        info!(
            "Planner resolved {} duplicate classes at epoch {}",
            classes.len(),
            epoch
        );

        let mut deletes_and_moves: Vec<Action> = Vec::new();
        let mut links: Vec<Action> = Vec::new();
        let mut claimed_dests: HashSet<PathBuf> = HashSet::new();

        for class in &classes {
            let keeper_id = options
                .strategy
                .pick_keeper(&class.members, scope)?;
            let keeper = class
                .members
                .iter()
                .find(|m| m.record.file_id == keeper_id)
                .ok_or_else(|| Error::Internal("keeper not in class".into()))?;

            // Constraint: a must-keep file may only survive as the keeper.
            for member in &class.members {
                if member.record.file_id == keeper_id {
                    continue;
                }
                if matches(&must_keep, member) {
                    return Err(Error::PlanConflict(format!(
                        "class {}: reason=must_keep_would_be_removed, file {}",
                        class.key.describe(),
                        member.absolute_path.display()
                    )));
                }
            }

            let mut losers: Vec<&ClassMember> = class
                .members
                .iter()
                .filter(|m| m.record.file_id != keeper_id)
                .collect();
            losers.sort_by_key(|m| m.record.file_id);

            for loser in losers {
                // Same (device, inode) as the keeper: already one physical
                // file, nothing to reclaim.
                if loser.record.device == keeper.record.device
                    && loser.record.inode == keeper.record.inode
                {
                    debug!(
                        "Skipping {} (hardlink of keeper)",
                        loser.absolute_path.display()
                    );
                    continue;
                }

                let action = self.decide_action(
                    loser,
                    keeper,
                    &options.constraints,
                    &mut claimed_dests,
                )?;

                if matches!(action, Action::Delete { .. }) && matches(&must_not_delete, loser) {
                    return Err(Error::PlanConflict(format!(
                        "class {}: reason=must_not_delete_would_be_deleted, file {}",
                        class.key.describe(),
                        loser.absolute_path.display()
                    )));
                }

                match action {
                    Action::ReplaceWithLink { .. } => links.push(action),
                    other => deletes_and_moves.push(other),
                }
            }
        }

        // Linearize: deletes and moves before any link that references a
        // keeper, so links never traverse a path a move still occupies.
        let actions: Vec<PlanAction> = deletes_and_moves
            .into_iter()
            .chain(links)
            .enumerate()
            .map(|(i, action)| PlanAction {
                seq: i as u32,
                action,
            })
            .collect();

        let strategy = options.strategy.descriptor();
        let plan_id = derive_plan_id(epoch, &strategy, &options.constraints, &actions)?;

        Ok(Plan {
            plan_id,
            catalog_epoch: epoch,
            strategy,
            constraints: options.constraints.clone(),
            actions,
        })
    }

    /// Exact-content classes from the catalog's hash buckets.
    fn content_classes(
        &self,
        scope: &[RootId],
        root_paths: &HashMap<RootId, PathBuf>,
    ) -> Result<Vec<ResolvedClass>> {
        // BTreeMap keyed by (size, hash, algo) fixes the class order.
        let mut ordered: BTreeMap<(u64, Vec<u8>, &'static str), ResolvedClass> = BTreeMap::new();

        for algo in HashAlgo::ALL {
            for (hash, size, file_ids) in self.catalog.iter_hash_buckets(algo, 2)? {
                let mut members = Vec::new();
                for file_id in file_ids {
                    let Some(record) = self.catalog.get_file(file_id)? else {
                        continue;
                    };
                    if let Some(member) = self.admit(record, scope, root_paths) {
                        members.push(member);
                    }
                }
                if members.len() < 2 {
                    continue;
                }
                members.sort_by_key(|m| m.record.file_id);
                ordered.insert(
                    (size, hash.clone(), algo.name()),
                    ResolvedClass {
                        key: ClassKey::Content { algo, hash, size },
                        members,
                    },
                );
            }
        }

        Ok(ordered.into_values().collect())
    }

    /// Similarity clusters over files not already in a content class.
    fn similarity_classes(
        &self,
        threshold: f32,
        scope: &[RootId],
        root_paths: &HashMap<RootId, PathBuf>,
        consumed: &mut HashSet<FileId>,
    ) -> Result<Vec<ResolvedClass>> {
        let embeddings = self.catalog.list_embeddings()?;
        if embeddings.is_empty() {
            return Ok(Vec::new());
        }
        let dim = embeddings[0].1.len() as u16;
        let mut index = BruteForceIndex::new(dim);
        for (id, vector) in &embeddings {
            index.add(*id, vector)?;
        }

        // Map embedding ids back to admitted, unconsumed files.
        let mut by_embedding: HashMap<u64, Vec<ClassMember>> = HashMap::new();
        for record in self.catalog.list_files(None)? {
            let Some(embedding_id) = record.embedding_id else {
                continue;
            };
            if consumed.contains(&record.file_id) {
                continue;
            }
            if let Some(member) = self.admit(record, scope, root_paths) {
                by_embedding.entry(embedding_id).or_default().push(member);
            }
        }

        let mut clusters: Vec<Vec<ClassMember>> = index
            .clusters(threshold)
            .into_iter()
            .map(|embedding_ids| {
                let mut members: Vec<ClassMember> = embedding_ids
                    .iter()
                    .flat_map(|id| by_embedding.get(id).cloned().unwrap_or_default())
                    .collect();
                members.sort_by_key(|m| m.record.file_id);
                members
            })
            .filter(|members| members.len() >= 2)
            .collect();
        clusters.sort_by_key(|members| members[0].record.file_id);

        Ok(clusters
            .into_iter()
            .enumerate()
            .map(|(i, members)| {
                for member in &members {
                    consumed.insert(member.record.file_id);
                }
                ResolvedClass {
                    key: ClassKey::Similarity { cluster: i as u64 },
                    members,
                }
            })
            .collect())
    }

    fn admit(
        &self,
        record: FileRecord,
        scope: &[RootId],
        root_paths: &HashMap<RootId, PathBuf>,
    ) -> Option<ClassMember> {
        if record.state != crate::types::FileState::Present {
            return None;
        }
        if !scope.is_empty() && !scope.contains(&record.root_id) {
            return None;
        }
        let root = root_paths.get(&record.root_id)?;
        let absolute_path = root.join(&record.relative_path);
        Some(ClassMember {
            record,
            absolute_path,
        })
    }

    fn decide_action(
        &self,
        loser: &ClassMember,
        keeper: &ClassMember,
        constraints: &Constraints,
        claimed_dests: &mut HashSet<PathBuf>,
    ) -> Result<Action> {
        if let Some(kind) = constraints.link_kind {
            let permitted = match kind {
                LinkKind::Hard => {
                    constraints.allow_hardlink
                        && loser.record.device == keeper.record.device
                }
                LinkKind::Sym => constraints.allow_symlink,
            };
            if permitted {
                return Ok(Action::ReplaceWithLink {
                    file_id: loser.record.file_id,
                    path: loser.absolute_path.clone(),
                    keeper_file_id: keeper.record.file_id,
                    keeper_path: keeper.absolute_path.clone(),
                    link_kind: kind,
                });
            }
        }

        if let Some(retention_dir) = &constraints.retention_dir {
            let dest = self.unique_dest(retention_dir, loser, claimed_dests);
            return Ok(Action::Move {
                file_id: loser.record.file_id,
                path: loser.absolute_path.clone(),
                dest,
            });
        }

        Ok(Action::Delete {
            file_id: loser.record.file_id,
            path: loser.absolute_path.clone(),
        })
    }

    /// A retention destination that does not exist at plan-creation time
    /// and is not claimed by an earlier action of this plan.
    fn unique_dest(
        &self,
        retention_dir: &std::path::Path,
        loser: &ClassMember,
        claimed: &mut HashSet<PathBuf>,
    ) -> PathBuf {
        let base = retention_dir
            .join(format!("root-{}", loser.record.root_id))
            .join(&loser.record.relative_path);
        let mut dest = base.clone();
        let mut suffix = 1u32;
        while dest.exists() || claimed.contains(&dest) {
            dest = PathBuf::from(format!("{}.dup{}", base.display(), suffix));
            suffix += 1;
        }
        claimed.insert(dest.clone());
        dest
    }
}

fn build_globset(patterns: &[String], what: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("bad {what} glob {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::InvalidInput(format!("bad {what} globs: {e}")))
}

fn matches(set: &GlobSet, member: &ClassMember) -> bool {
    set.is_match(&member.record.relative_path) || set.is_match(&member.absolute_path)
}

/// ULID derived from the plan content, so identical inputs produce
/// byte-identical plans across runs.
fn derive_plan_id(
    epoch: u64,
    strategy: &crate::types::StrategyDescriptor,
    constraints: &Constraints,
    actions: &[PlanAction],
) -> Result<ulid::Ulid> {
    let mut state = HashAlgo::Sha256.algorithm().new_hasher();
    state.update(&epoch.to_le_bytes());
    state.update(serde_json::to_string(strategy)?.as_bytes());
    state.update(serde_json::to_string(constraints)?.as_bytes());
    state.update(serde_json::to_string(actions)?.as_bytes());
    let digest = state.finalize();

    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    Ok(ulid::Ulid::from(u128::from_be_bytes(raw)))
}
