//! Configuração do ticketflow carregada a partir de `ticketflow.toml`.
//!
//! A struct [`TicketflowConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! A variável de ambiente `TICKETFLOW_DATA_DIR` tem precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::graph::{GraphSettings, RetryPolicy, RevisionLimits};
use crate::orchestrator::OrchestratorSettings;
use crate::state_machine::TenantId;
use crate::telemetry::LogFormat;

/// Arquivo procurado no diretório atual quando nenhum caminho é informado.
pub const DEFAULT_CONFIG_FILE: &str = "ticketflow.toml";

/// Políticas por tenant, em `[tenants.<id>]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Termina o ticket após a aprovação do plano, sem implementação.
    pub skip_implementation: bool,
    /// Exige revisão humana da atualização do ticket antes do planejamento.
    pub review_ticket_updates: bool,
}

/// Configuração de nível superior carregada de `ticketflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct TicketflowConfig {
    /// Diretório onde tickets e checkpoints são gravados.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Prazo de cada tentativa de um step, em segundos.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Tentativas por step (incluindo a primeira) para falhas transitórias.
    #[serde(default = "default_step_max_attempts")]
    pub step_max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto do atraso entre tentativas.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_max_plan_revisions")]
    pub max_plan_revisions: u32,

    #[serde(default = "default_max_ticket_update_revisions")]
    pub max_ticket_update_revisions: u32,

    /// Checkpoints mais antigos que isso são removidos por `purge-checkpoints`.
    #[serde(default = "default_checkpoint_ttl_hours")]
    pub checkpoint_ttl_hours: u64,

    #[serde(default)]
    pub tenants: BTreeMap<String, TenantSettings>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".ticketflow")
}

// 5 minutos por tentativa.
fn default_step_timeout_secs() -> u64 {
    300
}

fn default_step_max_attempts() -> u32 {
    3
}

// Valor padrão para o atraso base: 1000ms.
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_max_plan_revisions() -> u32 {
    5
}

fn default_max_ticket_update_revisions() -> u32 {
    3
}

// Uma semana.
fn default_checkpoint_ttl_hours() -> u64 {
    168
}

impl Default for TicketflowConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_format: LogFormat::default(),
            step_timeout_secs: default_step_timeout_secs(),
            step_max_attempts: default_step_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_plan_revisions: default_max_plan_revisions(),
            max_ticket_update_revisions: default_max_ticket_update_revisions(),
            checkpoint_ttl_hours: default_checkpoint_ttl_hours(),
            tenants: BTreeMap::new(),
        }
    }
}

impl TicketflowConfig {
    /// Carrega a configuração de `ticketflow.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega a configuração de `path`, com defaults se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::parse(&contents).with_context(|| format!("invalid config in {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo de configuração.
        if let Ok(dir) = std::env::var("TICKETFLOW_DATA_DIR")
            && !dir.is_empty()
        {
            config.data_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config = toml::from_str::<TicketflowConfig>(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.step_max_attempts >= 1, "step_max_attempts must be at least 1");
        anyhow::ensure!(self.step_timeout_secs >= 1, "step_timeout_secs must be at least 1");
        anyhow::ensure!(
            self.base_delay_ms <= self.max_delay_ms,
            "base_delay_ms ({}) exceeds max_delay_ms ({})",
            self.base_delay_ms,
            self.max_delay_ms
        );
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.step_max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn graph_settings(&self) -> GraphSettings {
        GraphSettings {
            retry: self.retry_policy(),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            limits: RevisionLimits {
                plan: self.max_plan_revisions,
                ticket_update: self.max_ticket_update_revisions,
            },
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            graph: self.graph_settings(),
            tenants: self.tenants.clone(),
        }
    }

    /// Políticas do tenant, ou as padrão se ele não estiver configurado.
    pub fn tenant(&self, tenant_id: &TenantId) -> TenantSettings {
        self.tenants.get(tenant_id.as_str()).cloned().unwrap_or_default()
    }

    pub fn checkpoint_ttl(&self) -> chrono::Duration {
        // Capped at a century so the conversion cannot overflow.
        let hours = self.checkpoint_ttl_hours.min(24 * 365 * 100);
        chrono::Duration::hours(hours as i64)
    }

    pub fn tickets_dir(&self) -> PathBuf {
        self.data_dir.join("tickets")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }
}
