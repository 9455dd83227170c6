//! Stable on-disk plan artifact.
//!
//! The JSON layout is a compatibility surface: all fields are required,
//! unknown fields are `PlanInvalid`, and writing then reading a plan is
//! the identity. The raw form is validated field by field before
//! conversion into the typed [`Plan`].

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{Action, Constraints, LinkKind, Plan, PlanAction, StrategyDescriptor};

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPlan {
    plan_id: String,
    catalog_epoch: u64,
    strategy: RawStrategy,
    constraints: Constraints,
    actions: Vec<RawAction>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStrategy {
    name: String,
    params: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAction {
    seq: u32,
    kind: String,
    file_id: u64,
    path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keeper_file_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    keeper_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    link_kind: Option<LinkKind>,
}

/// Serialize a plan to its stable JSON form.
pub fn to_json(plan: &Plan) -> Result<String> {
    let raw = RawPlan {
        plan_id: plan.plan_id.to_string(),
        catalog_epoch: plan.catalog_epoch,
        strategy: RawStrategy {
            name: plan.strategy.name.clone(),
            params: plan.strategy.params.clone(),
        },
        constraints: plan.constraints.clone(),
        actions: plan.actions.iter().map(raw_action).collect(),
    };
    Ok(serde_json::to_string_pretty(&raw)?)
}

fn raw_action(pa: &PlanAction) -> RawAction {
    match &pa.action {
        Action::Delete { file_id, path } => RawAction {
            seq: pa.seq,
            kind: "Delete".into(),
            file_id: *file_id,
            path: path.clone(),
            dest: None,
            keeper_file_id: None,
            keeper_path: None,
            link_kind: None,
        },
        Action::Move {
            file_id,
            path,
            dest,
        } => RawAction {
            seq: pa.seq,
            kind: "Move".into(),
            file_id: *file_id,
            path: path.clone(),
            dest: Some(dest.clone()),
            keeper_file_id: None,
            keeper_path: None,
            link_kind: None,
        },
        Action::ReplaceWithLink {
            file_id,
            path,
            keeper_file_id,
            keeper_path,
            link_kind,
        } => RawAction {
            seq: pa.seq,
            kind: "ReplaceWithLink".into(),
            file_id: *file_id,
            path: path.clone(),
            dest: None,
            keeper_file_id: Some(*keeper_file_id),
            keeper_path: Some(keeper_path.clone()),
            link_kind: Some(*link_kind),
        },
    }
}

/// Parse and validate a plan artifact.
pub fn from_json(json: &str) -> Result<Plan> {
    let raw: RawPlan =
        serde_json::from_str(json).map_err(|e| Error::PlanInvalid(e.to_string()))?;

    let plan_id = ulid::Ulid::from_str(&raw.plan_id)
        .map_err(|e| Error::PlanInvalid(format!("bad plan_id {:?}: {e}", raw.plan_id)))?;

    let mut actions = Vec::with_capacity(raw.actions.len());
    let mut last_seq: Option<u32> = None;
    for raw_action in raw.actions {
        if let Some(prev) = last_seq {
            if raw_action.seq <= prev {
                return Err(Error::PlanInvalid(format!(
                    "action seq {} is not strictly increasing",
                    raw_action.seq
                )));
            }
        }
        last_seq = Some(raw_action.seq);
        actions.push(typed_action(raw_action)?);
    }

    Ok(Plan {
        plan_id,
        catalog_epoch: raw.catalog_epoch,
        strategy: StrategyDescriptor {
            name: raw.strategy.name,
            params: raw.strategy.params,
        },
        constraints: raw.constraints,
        actions,
    })
}

fn typed_action(raw: RawAction) -> Result<PlanAction> {
    let seq = raw.seq;
    let action = match raw.kind.as_str() {
        "Delete" => {
            reject_fields(seq, &raw, &["dest", "keeper_file_id", "keeper_path", "link_kind"])?;
            Action::Delete {
                file_id: raw.file_id,
                path: raw.path,
            }
        }
        "Move" => {
            reject_fields(seq, &raw, &["keeper_file_id", "keeper_path", "link_kind"])?;
            Action::Move {
                file_id: raw.file_id,
                path: raw.path,
                dest: raw.dest.ok_or_else(|| {
                    Error::PlanInvalid(format!("Move action {seq} is missing dest"))
                })?,
            }
        }
        "ReplaceWithLink" => {
            reject_fields(seq, &raw, &["dest"])?;
            Action::ReplaceWithLink {
                file_id: raw.file_id,
                path: raw.path,
                keeper_file_id: raw.keeper_file_id.ok_or_else(|| {
                    Error::PlanInvalid(format!(
                        "ReplaceWithLink action {seq} is missing keeper_file_id"
                    ))
                })?,
                keeper_path: raw.keeper_path.ok_or_else(|| {
                    Error::PlanInvalid(format!(
                        "ReplaceWithLink action {seq} is missing keeper_path"
                    ))
                })?,
                link_kind: raw.link_kind.ok_or_else(|| {
                    Error::PlanInvalid(format!(
                        "ReplaceWithLink action {seq} is missing link_kind"
                    ))
                })?,
            }
        }
        other => {
            return Err(Error::PlanInvalid(format!(
                "unknown action kind {other:?} at seq {seq}"
            )));
        }
    };
    Ok(PlanAction { seq, action })
}

fn reject_fields(seq: u32, raw: &RawAction, forbidden: &[&str]) -> Result<()> {
    for field in forbidden {
        let present = match *field {
            "dest" => raw.dest.is_some(),
            "keeper_file_id" => raw.keeper_file_id.is_some(),
            "keeper_path" => raw.keeper_path.is_some(),
            "link_kind" => raw.link_kind.is_some(),
            _ => false,
        };
        if present {
            return Err(Error::PlanInvalid(format!(
                "{} action {} must not carry {}",
                raw.kind, seq, field
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_plan() -> Plan {
        Plan {
            plan_id: ulid::Ulid::from(7u128),
            catalog_epoch: 3,
            strategy: StrategyDescriptor {
                name: "keep_newest_mtime".into(),
                params: serde_json::json!({}),
            },
            constraints: Constraints::default(),
            actions: vec![
                PlanAction {
                    seq: 0,
                    action: Action::Delete {
                        file_id: 123,
                        path: PathBuf::from("/a/b"),
                    },
                },
                PlanAction {
                    seq: 1,
                    action: Action::Move {
                        file_id: 124,
                        path: PathBuf::from("/a/c"),
                        dest: PathBuf::from("/trash/a/c"),
                    },
                },
                PlanAction {
                    seq: 2,
                    action: Action::ReplaceWithLink {
                        file_id: 125,
                        path: PathBuf::from("/a/d"),
                        keeper_file_id: 100,
                        keeper_path: PathBuf::from("/a/keep"),
                        link_kind: LinkKind::Hard,
                    },
                },
            ],
        }
    }

    #[test]
    fn round_trip_is_identity() {
        let plan = sample_plan();
        let json = to_json(&plan).unwrap();
        let parsed = from_json(&json).unwrap();

        assert_eq!(parsed.plan_id, plan.plan_id);
        assert_eq!(parsed.catalog_epoch, plan.catalog_epoch);
        assert_eq!(parsed.actions, plan.actions);
        // Byte-identical re-serialization.
        assert_eq!(to_json(&parsed).unwrap(), json);
    }

    #[test]
    fn unknown_fields_are_plan_invalid() {
        let mut value: serde_json::Value =
            serde_json::from_str(&to_json(&sample_plan()).unwrap()).unwrap();
        value["surprise"] = serde_json::json!(true);
        let result = from_json(&value.to_string());
        assert!(matches!(result, Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn missing_move_dest_is_plan_invalid() {
        let json = r#"{
            "plan_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "catalog_epoch": 1,
            "strategy": { "name": "keep_newest_mtime", "params": {} },
            "constraints": {},
            "actions": [
                { "seq": 0, "kind": "Move", "file_id": 1, "path": "/a" }
            ]
        }"#;
        assert!(matches!(from_json(json), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn non_monotonic_seq_is_plan_invalid() {
        let json = r#"{
            "plan_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "catalog_epoch": 1,
            "strategy": { "name": "keep_newest_mtime", "params": {} },
            "constraints": {},
            "actions": [
                { "seq": 1, "kind": "Delete", "file_id": 1, "path": "/a" },
                { "seq": 0, "kind": "Delete", "file_id": 2, "path": "/b" }
            ]
        }"#;
        assert!(matches!(from_json(json), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn delete_with_link_fields_is_plan_invalid() {
        let json = r#"{
            "plan_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "catalog_epoch": 1,
            "strategy": { "name": "keep_newest_mtime", "params": {} },
            "constraints": {},
            "actions": [
                { "seq": 0, "kind": "Delete", "file_id": 1, "path": "/a",
                  "link_kind": "hard" }
            ]
        }"#;
        assert!(matches!(from_json(json), Err(Error::PlanInvalid(_))));
    }

    #[test]
    fn hard_link_kind_parses() {
        let json = r#"{
            "plan_id": "01ARZ3NDEKTSV4RRFFQ69G5FAV",
            "catalog_epoch": 1,
            "strategy": { "name": "keep_newest_mtime", "params": {} },
            "constraints": {},
            "actions": [
                { "seq": 0, "kind": "ReplaceWithLink", "file_id": 1, "path": "/a",
                  "keeper_file_id": 2, "keeper_path": "/k", "link_kind": "hard" }
            ]
        }"#;
        let plan = from_json(json).unwrap();
        assert!(matches!(
            plan.actions[0].action,
            Action::ReplaceWithLink {
                link_kind: LinkKind::Hard,
                ..
            }
        ));
    }
}
