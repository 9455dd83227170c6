use std::path::PathBuf;

use nodupe_core::planner::{Planner, PlannerOptions, Strategy, artifact};
use nodupe_core::types::{Constraints, LinkKind};
use nodupe_core::{Catalog, CoreContext, Error};

use crate::output::OutputFormat;

#[derive(clap::Args)]
pub struct PlanArgs {
    /// Strategy name: keep_oldest_mtime, keep_newest_mtime,
    /// keep_shortest_path, keep_longest_path,
    /// keep_first_root_in_config_order, keep_by_path_pattern
    strategy: String,

    /// Restrict planning to these scanned roots (repeatable)
    #[arg(long = "scope", value_name = "PATH")]
    scope: Vec<PathBuf>,

    /// Must-keep glob; a plan that would remove a match is rejected
    #[arg(long = "keep", value_name = "GLOB")]
    keep: Vec<String>,

    /// Must-not-delete glob (repeatable)
    #[arg(long = "no-delete", value_name = "GLOB")]
    no_delete: Vec<String>,

    /// Replace losers with links to the keeper: hard or sym
    #[arg(long, value_name = "hard|sym")]
    link: Option<String>,

    /// Write the plan artifact here instead of stdout
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Move losers into this directory instead of deleting
    #[arg(long, value_name = "DIR")]
    retention_dir: Option<PathBuf>,

    /// Priority globs for keep_by_path_pattern (repeatable, ordered)
    #[arg(long = "priority-glob", value_name = "GLOB")]
    priority_globs: Vec<String>,

    /// Augment content classes with similarity clusters at this threshold
    #[arg(long, value_name = "THRESHOLD")]
    similarity: Option<f32>,
}

pub fn handle_plan(
    context: &CoreContext,
    args: PlanArgs,
    format: OutputFormat,
) -> anyhow::Result<u8> {
    let params = if args.priority_globs.is_empty() {
        serde_json::json!({})
    } else {
        serde_json::json!({ "priority_globs": args.priority_globs })
    };
    let strategy = Strategy::parse(&args.strategy, &params)?;

    let link_kind = args
        .link
        .as_deref()
        .map(|name| match name {
            "hard" => Ok(LinkKind::Hard),
            "sym" => Ok(LinkKind::Sym),
            other => Err(Error::InvalidInput(format!(
                "--link expects hard or sym, got {other}"
            ))),
        })
        .transpose()?;

    let catalog = super::open_catalog(context)?;

    // Scope paths must name already-scanned roots.
    let roots = catalog.list_roots()?;
    let mut scope_root_ids = Vec::with_capacity(args.scope.len());
    for path in &args.scope {
        let absolute = std::path::absolute(path)
            .map_err(|e| Error::InvalidInput(format!("bad scope path {}: {e}", path.display())))?;
        let root_id = roots
            .iter()
            .find(|(_, root)| *root == absolute)
            .map(|(id, _)| *id)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "scope {} is not a scanned root; run scan first",
                    absolute.display()
                ))
            })?;
        scope_root_ids.push(root_id);
    }

    let constraints = Constraints {
        scope_root_ids,
        must_keep: args.keep,
        must_not_delete: args.no_delete,
        allow_hardlink: matches!(link_kind, Some(LinkKind::Hard)),
        allow_symlink: matches!(link_kind, Some(LinkKind::Sym)),
        link_kind,
        retention_dir: args.retention_dir,
    };

    let planner = Planner::new(&catalog);
    let plan = planner.build_plan(&PlannerOptions {
        strategy,
        constraints,
        similarity_threshold: args.similarity,
    })?;

    catalog.store_plan(&plan)?;
    let json = artifact::to_json(&plan)?;
    match &args.out {
        Some(path) => std::fs::write(path, &json)?,
        None => println!("{json}"),
    }

    format.print(&plan_summary(&plan), || {
        format!(
            "plan {} at epoch {}: {} actions{}",
            plan.plan_id,
            plan.catalog_epoch,
            plan.actions.len(),
            args.out
                .as_ref()
                .map(|p| format!(", written to {}", p.display()))
                .unwrap_or_default(),
        )
    })?;
    Ok(0)
}

#[derive(serde::Serialize)]
struct PlanSummary {
    plan_id: String,
    catalog_epoch: u64,
    actions: usize,
}

fn plan_summary(plan: &nodupe_core::Plan) -> PlanSummary {
    PlanSummary {
        plan_id: plan.plan_id.to_string(),
        catalog_epoch: plan.catalog_epoch,
        actions: plan.actions.len(),
    }
}
