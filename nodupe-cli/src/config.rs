//! TOML configuration loading for the CLI.

use std::path::Path;

use anyhow::Context;

use nodupe_core::CoreConfig;

/// Default config file names probed in order when `--config` is absent.
const DEFAULT_PATHS: [&str; 2] = ["nodupe.toml", ".nodupe.toml"];

/// Load configuration from `path`, a default location, or built-in
/// defaults. Unknown keys are rejected.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<CoreConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
        }
        None => {
            for candidate in DEFAULT_PATHS {
                let path = Path::new(candidate);
                if path.exists() {
                    return load_config(Some(path));
                }
            }
            Ok(CoreConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_recognized_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodupe.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
[catalog]
path = "/var/lib/nodupe/catalog.redb"
group_commit_ms = 50

[snapshot]
hash_algorithm = "blake3"

[scan]
workers = 4
media_profile = "hdd"

[apply]
retry_attempts = 5
policy_on_missing = "ignore"

[rollback]
retention_days = 7
"#
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.catalog.group_commit_ms, 50);
        assert_eq!(config.scan.workers, 4);
        assert_eq!(config.apply.retry_attempts, 5);
        assert_eq!(config.rollback.retention_days, 7);
        assert_eq!(
            config.snapshot.hash_algorithm,
            nodupe_core::HashAlgo::Blake3
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodupe.toml");
        std::fs::write(&path, "[scan]\nturbo = true\n").unwrap();
        assert!(load_config(Some(&path)).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_config(Some(Path::new("/no/such/nodupe.toml"))).is_err());
    }
}
