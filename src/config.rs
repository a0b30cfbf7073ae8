//! Configuração do motor carregada a partir de `jobkernel.toml`.
//!
//! A struct [`EngineConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `JOBKERNEL_WORKERS` tem precedência sobre o arquivo.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::EngineError;

/// Arquivo lido por [`EngineConfig::load`].
pub const CONFIG_FILE: &str = "jobkernel.toml";

/// Variável de ambiente que sobrescreve `worker_threads`.
pub const WORKERS_ENV: &str = "JOBKERNEL_WORKERS";

/// Estratégia de execução usada como team padrão.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamKind {
    /// Executa o job na própria thread que o ativou.
    Passive,
    /// Pool fixo de threads do sistema operacional.
    Pool,
    /// Uma thread nova por job.
    ThreadPerJob,
    /// Pool de bloqueio do runtime tokio.
    Tokio,
}

/// Configuração de nível superior carregada de `jobkernel.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Número de threads do team `pool`.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Intervalo em milissegundos entre verificações de timeout do monitor.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Nível de log quando `--verbose` não é usado.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Team padrão dos grafos criados pela CLI.
    #[serde(default = "default_team")]
    pub team: TeamKind,
}

// Valor padrão de threads: paralelismo disponível na máquina.
fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

// Valor padrão do intervalo do monitor: 50ms.
fn default_monitor_interval_ms() -> u64 {
    50
}

// Valor padrão do nível de log: "info".
fn default_log_level() -> String {
    "info".to_string()
}

fn default_team() -> TeamKind {
    TeamKind::Pool
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            monitor_interval_ms: default_monitor_interval_ms(),
            log_level: default_log_level(),
            team: default_team(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração de `jobkernel.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self, EngineError> {
        let mut config = Self::load_from(Path::new(CONFIG_FILE))?;
        config.apply_workers_override(std::env::var(WORKERS_ENV).ok())?;
        Ok(config)
    }

    /// Carrega de um caminho explícito, sem consultar o ambiente.
    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<EngineConfig>(&contents)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Aplica o valor de `JOBKERNEL_WORKERS`, se presente e não vazio.
    pub fn apply_workers_override(&mut self, value: Option<String>) -> Result<(), EngineError> {
        if let Some(raw) = value
            && !raw.trim().is_empty()
        {
            self.worker_threads = raw.trim().parse().map_err(|_| {
                EngineError::Config(format!("{WORKERS_ENV} must be a positive integer, got `{raw}`"))
            })?;
            self.validate()?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.worker_threads == 0 {
            return Err(EngineError::Config("worker_threads must be at least 1".into()));
        }
        if self.monitor_interval_ms == 0 {
            return Err(EngineError::Config("monitor_interval_ms must be at least 1".into()));
        }
        Ok(())
    }

    pub fn log_filter(&self) -> log::LevelFilter {
        match self.log_level.to_lowercase().as_str() {
            "trace" => log::LevelFilter::Trace,
            "debug" => log::LevelFilter::Debug,
            "warn" => log::LevelFilter::Warn,
            "error" => log::LevelFilter::Error,
            "off" => log::LevelFilter::Off,
            _ => log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = EngineConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.monitor_interval_ms, 50);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.team, TeamKind::Pool);
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            worker_threads = 8
            team = "thread_per_job"
        "#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.worker_threads, 8);
        assert_eq!(config.team, TeamKind::ThreadPerJob);
        assert_eq!(config.monitor_interval_ms, 50);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "monitor_interval_ms = 10\nlog_level = \"debug\"").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert_eq!(config.monitor_interval_ms, 10);
        assert_eq!(config.log_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.monitor_interval_ms, 50);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "worker_threads = \"many\"").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(EngineError::Toml(_))));
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "worker_threads = 0").unwrap();
        assert!(matches!(EngineConfig::load_from(&path), Err(EngineError::Config(_))));
    }

    #[test]
    fn workers_override() {
        let mut config = EngineConfig::default();
        config.apply_workers_override(Some("3".into())).unwrap();
        assert_eq!(config.worker_threads, 3);

        config.apply_workers_override(Some("  ".into())).unwrap();
        assert_eq!(config.worker_threads, 3);

        assert!(config.apply_workers_override(Some("lots".into())).is_err());
        assert!(config.apply_workers_override(Some("0".into())).is_err());
    }
}
