//! Configuração do repairflow carregada a partir de `repairflow.toml`.
//!
//! A struct [`RepairflowConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `REPAIRFLOW_STORE` tem precedência sobre o arquivo
//! para o caminho do armazenamento.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::RetryConfig;
use crate::state_machine::{CatalogOverrides, DEFAULT_QUALITY_THRESHOLD, JobState};

/// Arquivo de configuração procurado no diretório atual.
pub const DEFAULT_CONFIG_FILE: &str = "repairflow.toml";

/// Variável de ambiente que sobrepõe `store_path`.
pub const STORE_ENV: &str = "REPAIRFLOW_STORE";

/// Configuração de nível superior carregada de `repairflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepairflowConfig {
    /// Nota mínima (0 a 100) da inspeção de qualidade para concluir um job.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: u8,

    /// Intervalo em segundos entre varreduras de escalonamento.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Caminho do snapshot JSON com jobs e trilha de auditoria.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Nível de log padrão quando `RUST_LOG` não está definido.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Máximo de retentativas de uma transição em conflito.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Timeouts de escalonamento por estado, em minutos (ex.: `IN_DIAGNOSIS = 720`).
    #[serde(default)]
    pub escalation_minutes: BTreeMap<String, u32>,
}

// Valor padrão para a nota mínima de qualidade: 95.
fn default_quality_threshold() -> u8 {
    DEFAULT_QUALITY_THRESHOLD
}

// Valor padrão para o intervalo de varredura: 5 minutos.
fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_store_path() -> PathBuf {
    PathBuf::from("repairflow.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

// Valor padrão para retentativas máximas: 3.
fn default_max_retries() -> u32 {
    3
}

// Valor padrão para o atraso base: 100ms.
fn default_base_delay_ms() -> u64 {
    100
}

impl Default for RepairflowConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            sweep_interval_secs: default_sweep_interval_secs(),
            store_path: default_store_path(),
            log_level: default_log_level(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            escalation_minutes: BTreeMap::new(),
        }
    }
}

impl RepairflowConfig {
    /// Carrega a configuração do caminho informado ou de `repairflow.toml` no
    /// diretório atual. Um caminho explícito precisa existir; o arquivo padrão
    /// é opcional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_store_env(path, std::env::var_os(STORE_ENV))
    }

    fn load_with_store_env(path: Option<&Path>, store_env: Option<OsString>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };

        // Variável de ambiente tem precedência sobre o arquivo para o armazenamento.
        if let Some(store) = store_env
            && !store.is_empty()
        {
            config.store_path = PathBuf::from(store);
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.quality_threshold > 100 {
            bail!(
                "quality_threshold must be between 0 and 100, got {}",
                self.quality_threshold
            );
        }
        if self.sweep_interval_secs == 0 {
            bail!("sweep_interval_secs must be greater than zero");
        }
        self.catalog_overrides()?;
        Ok(())
    }

    /// Ajustes aplicados sobre o catálogo padrão de estados.
    pub fn catalog_overrides(&self) -> Result<CatalogOverrides> {
        let mut escalation_minutes = BTreeMap::new();
        for (state, minutes) in &self.escalation_minutes {
            let state: JobState = state
                .parse()
                .with_context(|| format!("invalid key in [escalation_minutes]: {state}"))?;
            escalation_minutes.insert(state, *minutes);
        }
        Ok(CatalogOverrides {
            quality_threshold: Some(self.quality_threshold),
            escalation_minutes,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = RepairflowConfig::default();
        assert_eq!(config.quality_threshold, 95);
        assert_eq!(config.sweep_interval_secs, 300);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 100);
        assert_eq!(config.store_path, PathBuf::from("repairflow.json"));
        assert!(config.escalation_minutes.is_empty());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            quality_threshold = 90
            max_retries = 5

            [escalation_minutes]
            IN_DIAGNOSIS = 720
        "#;
        let config: RepairflowConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.quality_threshold, 90);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay_ms, 100);

        let overrides = config.catalog_overrides().unwrap();
        assert_eq!(overrides.quality_threshold, Some(90));
        assert_eq!(overrides.escalation_minutes[&JobState::InDiagnosis], 720);
    }

    #[test]
    fn load_reads_explicit_file_and_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repairflow.toml");
        std::fs::write(&path, "store_path = \"from-file.json\"\nsweep_interval_secs = 60\n").unwrap();

        let config = RepairflowConfig::load_with_store_env(Some(&path), None).unwrap();
        assert_eq!(config.store_path, PathBuf::from("from-file.json"));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));

        let config =
            RepairflowConfig::load_with_store_env(Some(&path), Some("/tmp/env.json".into()))
                .unwrap();
        assert_eq!(config.store_path, PathBuf::from("/tmp/env.json"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(RepairflowConfig::load_with_store_env(Some(&path), None).is_err());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repairflow.toml");

        std::fs::write(&path, "quality_threshold = 120\n").unwrap();
        assert!(RepairflowConfig::load_with_store_env(Some(&path), None).is_err());

        std::fs::write(&path, "[escalation_minutes]\nSOMEWHERE = 10\n").unwrap();
        let err = RepairflowConfig::load_with_store_env(Some(&path), None).unwrap_err();
        assert!(err.to_string().contains("escalation_minutes"));
    }

    #[test]
    fn retry_config_follows_settings() {
        let config = RepairflowConfig {
            max_retries: 7,
            base_delay_ms: 20,
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 7);
        assert_eq!(retry.delay_for_attempt(2), 40);
    }
}
