// ⚙️ Pipeline configuration
//
// JSON file (every field optional) + a few environment overrides. Loaded once
// by the binary; the library only ever sees the resulting struct.

use crate::extract::DocumentType;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "statement-ledger.json";

pub const ENV_DB_PATH: &str = "LEDGER_DB_PATH";
pub const ENV_WORKERS: &str = "LEDGER_WORKERS";
pub const ENV_LOG: &str = "LEDGER_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database_path: PathBuf,
    /// Sibling directory processed files are moved into
    pub processed_dir_name: String,
    pub workers: usize,
    /// Absolute reconciliation tolerance
    pub tolerance: Decimal,
    /// tracing EnvFilter directive used when RUST_LOG is unset
    pub log_filter: String,
    /// Optional plain-text file receiving every `FILE | HASH | STATUS` line
    pub status_log_path: Option<PathBuf>,
    /// Descriptions that mark a credit in single-amount card exports
    pub credit_descriptions: Vec<String>,
    pub sources: Vec<SourceConfig>,
    pub busy_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ledger.db"),
            processed_dir_name: "processed".to_string(),
            workers: 4,
            tolerance: Decimal::new(1, 2), // 0.01
            log_filter: "info".to_string(),
            status_log_path: None,
            credit_descriptions: Vec::new(),
            sources: Vec::new(),
            busy_timeout_ms: 5_000,
        }
    }
}

/// One inbox directory and what it holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub directory: PathBuf,
    pub source_id: String,
    pub document_type: DocumentType,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
}

fn default_extensions() -> Vec<String> {
    ["pdf", "xls", "xlsx", "csv"]
        .iter()
        .map(|e| e.to_string())
        .collect()
}

impl PipelineConfig {
    /// `path` when given (must exist), else `statement-ledger.json` in the
    /// working directory if present, else defaults. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Apply LEDGER_* overrides from `lookup`. Unparseable values are ignored
    /// with a warning.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(ENV_DB_PATH) {
            self.database_path = PathBuf::from(val);
        }

        if let Some(val) = lookup(ENV_WORKERS) {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => self.workers = n,
                _ => tracing::warn!(value = %val, "ignoring invalid {}", ENV_WORKERS),
            }
        }

        if let Some(val) = lookup(ENV_LOG) {
            self.log_filter = val;
        }
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(
            &path,
            r#"{
                "workers": 2,
                "tolerance": "0.5",
                "credit_descriptions": ["Pago Pesos TEF"],
                "sources": [
                    {"directory": "inbox/chile", "source_id": "banco-de-chile", "document_type": "checking_statement"}
                ]
            }"#,
        )
        .unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.tolerance, Decimal::new(5, 1));
        assert_eq!(config.processed_dir_name, "processed");
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.sources[0].document_type, DocumentType::CheckingStatement);
        assert_eq!(config.sources[0].extensions, default_extensions());
        assert!(!config.sources[0].recursive);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_DB_PATH, "/data/ledger.db"),
            (ENV_WORKERS, "8"),
            (ENV_LOG, "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = PipelineConfig::default();
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.database_path, PathBuf::from("/data/ledger.db"));
        assert_eq!(config.workers, 8);
        assert_eq!(config.log_filter, "debug");
    }

    #[test]
    fn test_invalid_worker_override_is_ignored() {
        let mut config = PipelineConfig::default();
        config.apply_env(|key| (key == ENV_WORKERS).then(|| "zero".to_string()));
        assert_eq!(config.workers, 4);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(PipelineConfig::load(Some(Path::new("/nonexistent/ledger.json"))).is_err());
    }
}
