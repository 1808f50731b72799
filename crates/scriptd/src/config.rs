use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, DaemonResult};

pub(crate) const DEFAULT_RETENTION_DAYS: u64 = 7;
pub(crate) const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;

pub(crate) const CONFIG_FILE_NAME: &str = "scriptd.yaml";
const LEDGER_FILE_NAME: &str = "ledger.json";

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Runtime data (job directories, ledger snapshot) lives here.
    pub base_dir: PathBuf,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    #[serde(default)]
    pub engine: engine::EngineConfig,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Terminal records older than this many days are purged.
    pub retention_days: u64,
    /// Interval between purge + ledger snapshot passes.
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            retention_days: DEFAULT_RETENTION_DAYS,
            interval_secs: DEFAULT_MAINTENANCE_INTERVAL_SECS,
        }
    }
}

impl DaemonConfig {
    pub fn ledger_snapshot_path(&self) -> PathBuf {
        self.base_dir.join(LEDGER_FILE_NAME)
    }

    /// Resolve relative paths against `config_dir` (the directory containing
    /// the YAML file); the jobs dir additionally resolves against `base_dir`.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.base_dir.is_relative() {
            self.base_dir = config_dir.join(&self.base_dir);
        }
        if self.engine.jobs_dir.is_relative() {
            self.engine.jobs_dir = self.base_dir.join(&self.engine.jobs_dir);
        }
    }
}

/// Load and validate a daemon config from a YAML file.
pub async fn load(path: &Path) -> DaemonResult<DaemonConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| DaemonError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: DaemonConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| DaemonError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config)?;
    Ok(config)
}

/// Write a default `scriptd.yaml` into `dir` and return its path.
pub async fn generate(dir: &Path) -> DaemonResult<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DaemonError::Config(format!("create {}: {e}", dir.display())))?;

    let config = DaemonConfig {
        base_dir: PathBuf::from("scriptd-data"),
        maintenance: MaintenanceConfig::default(),
        engine: engine::EngineConfig::default(),
    };
    let content = serde_yaml_ng::to_string(&config)
        .map_err(|e| DaemonError::Config(format!("serialize config: {e}")))?;

    let config_path = dir.join(CONFIG_FILE_NAME);
    tokio::fs::write(&config_path, content)
        .await
        .map_err(|e| DaemonError::Config(format!("write {}: {e}", config_path.display())))?;
    Ok(config_path)
}

fn validate(config: &DaemonConfig) -> DaemonResult<()> {
    if config.engine.languages.is_empty() {
        return Err(DaemonError::Config("language table is empty".into()));
    }
    let limits = &config.engine.limits;
    if limits.max_jobs_per_user == 0 {
        return Err(DaemonError::Config("max_jobs_per_user must be > 0".into()));
    }
    if limits.max_source_bytes == 0 {
        return Err(DaemonError::Config("max_source_bytes must be > 0".into()));
    }
    if limits.sample_interval_ms == 0 {
        return Err(DaemonError::Config("sample_interval_ms must be > 0".into()));
    }
    if config.maintenance.interval_secs == 0 {
        return Err(DaemonError::Config(
            "maintenance.interval_secs must be > 0".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
base_dir: data
maintenance:
  retention_days: 3
  interval_secs: 60
engine:
  limits:
    max_jobs_per_user: 4
    cpu_limit_percent: 25.0
  security:
    enable_sandbox: false
    admin_users: [99]
"#;
        let config_path = dir.path().join("scriptd.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.base_dir, dir.path().join("data"));
        assert_eq!(config.engine.jobs_dir, dir.path().join("data").join("jobs"));
        assert_eq!(config.maintenance.retention_days, 3);
        assert_eq!(config.engine.limits.max_jobs_per_user, 4);
        assert_eq!(config.engine.limits.cpu_limit_percent, 25.0);
        assert!(!config.engine.security.enable_sandbox);
        assert_eq!(config.engine.security.admin_users, vec![99]);
        // Omitted sections fall back to defaults, language table included.
        assert!(config.engine.languages.iter().any(|l| l.name == "python"));
    }

    #[tokio::test]
    async fn minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("scriptd.yaml");
        tokio::fs::write(&config_path, "base_dir: /var/lib/scriptd\n")
            .await
            .unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/var/lib/scriptd"));
        assert_eq!(config.maintenance.retention_days, DEFAULT_RETENTION_DAYS);
        assert_eq!(config.engine.limits.max_jobs_per_user, 10);
    }

    #[tokio::test]
    async fn empty_language_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: data\nengine:\n  languages: []\n";
        let config_path = dir.path().join("scriptd.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("language table"), "got: {err}");
    }

    #[tokio::test]
    async fn zero_sample_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: data\nengine:\n  limits:\n    sample_interval_ms: 0\n";
        let config_path = dir.path().join("scriptd.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("sample_interval_ms"), "got: {err}");
    }

    #[tokio::test]
    async fn generate_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = generate(dir.path()).await.unwrap();
        assert_eq!(config_path, dir.path().join(CONFIG_FILE_NAME));

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.base_dir, dir.path().join("scriptd-data"));
        assert_eq!(
            config.ledger_snapshot_path(),
            dir.path().join("scriptd-data").join("ledger.json")
        );
        assert!(!config.engine.languages.is_empty());
    }

    #[tokio::test]
    async fn absolute_paths_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "base_dir: /srv/scriptd\nengine:\n  jobs_dir: /srv/jobs\n";
        let config_path = dir.path().join("scriptd.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.base_dir, PathBuf::from("/srv/scriptd"));
        assert_eq!(config.engine.jobs_dir, PathBuf::from("/srv/jobs"));
    }
}
