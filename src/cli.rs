//! Interface de linha de comando do ticketflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, status, cancel,
//! states, purge-checkpoints) e flags globais (--config, --data-dir,
//! --log-format, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ticketflow::telemetry::LogFormat;

/// ticketflow: orquestrador de tickets em fases com checkpoints.
#[derive(Debug, Parser)]
#[command(name = "ticketflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração (padrão: ./ticketflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Diretório de dados; sobrepõe o arquivo de configuração.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Formato dos logs.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa um ticket de demonstração do início ao fim, respondendo
    /// automaticamente às perguntas e revisões.
    Demo {
        /// Identificador do ticket de demonstração.
        #[arg(long, default_value = "DEMO-1")]
        ticket: String,

        #[arg(long, default_value = "demo")]
        tenant: String,
    },

    /// Mostra o estado atual de um ticket.
    Status {
        ticket: String,

        /// Imprime o status como JSON.
        #[arg(long)]
        json: bool,
    },

    /// Cancela um ticket.
    Cancel {
        ticket: String,

        #[arg(long, default_value = "cancelled from the command line")]
        reason: String,
    },

    /// Lista os estados do workflow e as transições válidas.
    States,

    /// Remove checkpoints mais antigos que o TTL configurado.
    PurgeCheckpoints {
        /// Sobrepõe `checkpoint_ttl_hours` da configuração.
        #[arg(long)]
        ttl_hours: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_status_subcommand() {
        let cli = Cli::parse_from(["ticketflow", "status", "PROJ-42", "--json"]);
        match cli.command {
            Command::Status { ticket, json } => {
                assert_eq!(ticket, "PROJ-42");
                assert!(json);
            }
            _ => panic!("expected Status command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "ticketflow",
            "--data-dir",
            "/tmp/flow",
            "--log-format",
            "json",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/flow")));
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Command::Demo { ticket, tenant } => {
                assert_eq!(ticket, "DEMO-1");
                assert_eq!(tenant, "demo");
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_purge_ttl() {
        let cli = Cli::parse_from(["ticketflow", "purge-checkpoints", "--ttl-hours", "12"]);
        assert!(matches!(
            cli.command,
            Command::PurgeCheckpoints { ttl_hours: Some(12) }
        ));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
