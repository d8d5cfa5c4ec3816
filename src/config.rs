//! Configuração do massblock carregada a partir de `massblock.toml`.
//!
//! A struct [`BlockerConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `FORUM_BASE_URL`, `FORUM_API_KEY` e
//! `FORUM_API_USERNAME` têm precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::state_machine::RetryConfig;

/// Configuração de nível superior carregada de `massblock.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockerConfig {
    /// URL base do fórum (ex.: "https://forum.example.com").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chave da API do fórum.
    #[serde(default)]
    pub api_key: String,

    /// Usuário em nome de quem os bloqueios são feitos.
    #[serde(default)]
    pub api_username: String,

    /// Tentativas por usuário antes de registrar uma falha transitória como definitiva.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Intervalo mínimo entre duas chamadas de bloqueio.
    #[serde(default = "default_min_call_spacing_ms")]
    pub min_call_spacing_ms: u64,

    /// Arquivo onde a operação corrente é persistida.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Retoma uma operação interrompida encontrada no arquivo ao iniciar.
    #[serde(default = "default_resume_interrupted")]
    pub resume_interrupted: bool,

    /// Por quantos dias o usuário fica ignorado no fórum.
    #[serde(default = "default_ignore_duration_days")]
    pub ignore_duration_days: u32,

    /// Timeout de cada requisição HTTP, em segundos.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

// Valor padrão para tentativas máximas: 3.
fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

// Uma chamada a cada 1,5s fica abaixo do limite usual do fórum.
fn default_min_call_spacing_ms() -> u64 {
    1500
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".massblock/operation.json")
}

fn default_resume_interrupted() -> bool {
    true
}

fn default_ignore_duration_days() -> u32 {
    365
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Default for BlockerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            api_username: String::new(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            min_call_spacing_ms: default_min_call_spacing_ms(),
            store_path: default_store_path(),
            resume_interrupted: default_resume_interrupted(),
            ignore_duration_days: default_ignore_duration_days(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BlockerConfig {
    /// Carrega a configuração de `massblock.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Path::new("massblock.toml"))?;
        config.apply_env();
        Ok(config)
    }

    /// Carrega de um caminho específico, sem aplicar variáveis de ambiente.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = toml::from_str::<BlockerConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    fn apply_env(&mut self) {
        let vars = [
            ("FORUM_BASE_URL", &mut self.base_url),
            ("FORUM_API_KEY", &mut self.api_key),
            ("FORUM_API_USERNAME", &mut self.api_username),
        ];
        for (name, field) in vars {
            if let Ok(value) = std::env::var(name)
                && !value.is_empty()
            {
                *field = value;
            }
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }
}
