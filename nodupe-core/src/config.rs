//! Core configuration.
//!
//! Every key recognized by the core lives here as a typed field; the CLI
//! deserializes this tree from TOML. Unknown keys are rejected and
//! out-of-range values surface as `InvalidInput`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::HashAlgo;

/// Top-level configuration recognized by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    pub catalog: CatalogConfig,
    pub snapshot: SnapshotConfig,
    pub scan: ScanConfig,
    pub apply: ApplyConfig,
    pub rollback: RollbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CatalogConfig {
    /// Path of the embedded database file.
    pub path: PathBuf,
    /// 0 = fsync on every commit; otherwise group-commit with this bounded
    /// flush window.
    pub group_commit_ms: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("nodupe.redb"),
            group_commit_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnapshotConfig {
    /// Root directory of the content-addressable snapshot store.
    pub root: PathBuf,
    pub hash_algorithm: HashAlgo,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("nodupe-snapshots"),
            hash_algorithm: HashAlgo::Sha256,
        }
    }
}

/// Parallelism profile of the scanned media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaProfile {
    Ssd,
    Hdd,
    Network,
    Auto,
}

impl MediaProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssd" => Some(MediaProfile::Ssd),
            "hdd" => Some(MediaProfile::Hdd),
            "network" => Some(MediaProfile::Network),
            "auto" => Some(MediaProfile::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScanConfig {
    /// 0 = derive from media profile and core count.
    pub workers: u16,
    pub media_profile: MediaProfile,
    /// Bytes of prefix (and suffix sample) read for the quick hash.
    pub quick_hash_bytes: u32,
    pub checkpoint_interval_s: u16,
    /// Records per catalog write transaction.
    pub batch_size: u32,
    /// Minimum digest length (bytes) the autotuner will accept.
    pub digest_length_floor: u8,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            media_profile: MediaProfile::Auto,
            quick_hash_bytes: 64 * 1024,
            checkpoint_interval_s: 5,
            batch_size: 256,
            digest_length_floor: 32,
        }
    }
}

impl ScanConfig {
    /// Worker count after applying the media profile.
    ///
    /// Rotational media is throttled to 2 workers to avoid seek thrash.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return usize::from(self.workers);
        }
        match self.media_profile {
            MediaProfile::Hdd => 2,
            MediaProfile::Network => 4,
            MediaProfile::Ssd | MediaProfile::Auto => num_cpus::get_physical().min(8),
        }
    }
}

/// What the executor does when a plan target no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMissing {
    Fail,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApplyConfig {
    pub retry_attempts: u8,
    pub policy_on_missing: OnMissing,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            policy_on_missing: OnMissing::Fail,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RollbackConfig {
    pub retention_days: u16,
    pub max_snapshots: u32,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            max_snapshots: 10_000,
        }
    }
}

impl CoreConfig {
    /// Validate ranges; violations are invalid input (CLI exit 2).
    pub fn validate(&self) -> Result<()> {
        if self.scan.quick_hash_bytes == 0 {
            return Err(Error::InvalidInput(
                "scan.quick_hash_bytes must be greater than 0".into(),
            ));
        }
        if self.scan.batch_size == 0 {
            return Err(Error::InvalidInput(
                "scan.batch_size must be greater than 0".into(),
            ));
        }
        if self.scan.checkpoint_interval_s == 0 {
            return Err(Error::InvalidInput(
                "scan.checkpoint_interval_s must be greater than 0".into(),
            ));
        }
        if usize::from(self.scan.digest_length_floor) > HashAlgo::Blake2b.digest_len() {
            return Err(Error::InvalidInput(format!(
                "scan.digest_length_floor {} exceeds every registered digest length",
                self.scan.digest_length_floor
            )));
        }
        if self.rollback.max_snapshots == 0 {
            return Err(Error::InvalidInput(
                "rollback.max_snapshots must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        CoreConfig::default().validate().unwrap();
    }

    #[test]
    fn hdd_profile_throttles_workers() {
        let scan = ScanConfig {
            media_profile: MediaProfile::Hdd,
            ..ScanConfig::default()
        };
        assert_eq!(scan.effective_workers(), 2);
    }

    #[test]
    fn explicit_workers_win_over_profile() {
        let scan = ScanConfig {
            workers: 5,
            media_profile: MediaProfile::Hdd,
            ..ScanConfig::default()
        };
        assert_eq!(scan.effective_workers(), 5);
    }

    #[test]
    fn zero_quick_hash_bytes_rejected() {
        let mut config = CoreConfig::default();
        config.scan.quick_hash_bytes = 0;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidInput(_))
        ));
    }
}
