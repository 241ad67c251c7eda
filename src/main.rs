mod cli;
mod demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use ticketflow::ports::{AgentExecutor, FileCheckpointStore, FileTicketRepository, TracingEventPublisher};
use ticketflow::state_machine::StatePartition;
use ticketflow::{
    Collaborators, StateMachine, TenantId, TicketId, TicketflowConfig, WorkflowOrchestrator, WorkflowState,
    telemetry,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => TicketflowConfig::load_from(path)?,
        None => TicketflowConfig::load()?,
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    telemetry::init(cli.log_format.unwrap_or(config.log_format), cli.verbose);

    match cli.command {
        Command::Demo { ticket, tenant } => {
            let orchestrator = file_orchestrator(&config, Arc::new(demo::DemoExecutor::new()));
            demo::run(orchestrator, &config, TenantId::new(tenant), TicketId::new(ticket)).await?;
        }
        Command::Status { ticket, json } => {
            let orchestrator = file_orchestrator(&config, Arc::new(demo::DemoExecutor::new()));
            let status = orchestrator
                .status(&TicketId::new(ticket.clone()))
                .await
                .with_context(|| format!("cannot read status of {ticket}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let summary = &status.summary;
                println!("Ticket:  {} (tenant {})", summary.ticket_id, summary.tenant_id);
                println!("State:   {}", summary.state);
                println!("Phase:   {}", summary.phase);
                if let Some(awaiting) = summary.awaiting {
                    println!("Waiting: {awaiting}");
                }
                if let Some(stage) = &status.graph.current_stage {
                    println!("Stage:   {stage}");
                }
                if let Some(failure) = &summary.failure {
                    println!("Failed:  {} ({})", failure.stage, failure.reason);
                }
                let path: Vec<String> = summary.state_transitions.iter().map(|s| s.to_string()).collect();
                println!("History: {}", path.join(" -> "));
            }
        }
        Command::Cancel { ticket, reason } => {
            let orchestrator = file_orchestrator(&config, Arc::new(demo::DemoExecutor::new()));
            let result = orchestrator.cancel(&TicketId::new(ticket), &reason).await?;
            println!("{} is {}", result.ticket_id, result.state);
        }
        Command::States => print_states(),
        Command::PurgeCheckpoints { ttl_hours } => {
            let ttl = match ttl_hours {
                Some(hours) => chrono::Duration::hours(hours.min(24 * 365 * 100) as i64),
                None => config.checkpoint_ttl(),
            };
            let store = FileCheckpointStore::new(config.checkpoints_dir());
            let removed = store.purge_expired(ttl).await?;
            println!("Removed {removed} expired checkpoint(s)");
        }
    }

    Ok(())
}

fn file_orchestrator(config: &TicketflowConfig, executor: Arc<dyn AgentExecutor>) -> Arc<WorkflowOrchestrator> {
    let collaborators = Collaborators {
        tickets: Arc::new(FileTicketRepository::new(config.tickets_dir())),
        checkpoints: Arc::new(FileCheckpointStore::new(config.checkpoints_dir())),
        events: Arc::new(TracingEventPublisher),
        executor,
    };
    Arc::new(WorkflowOrchestrator::new(collaborators, config.orchestrator_settings()))
}

fn print_states() {
    for state in WorkflowState::ALL {
        let next: Vec<String> = StateMachine::valid_transitions(state)
            .iter()
            .map(|s| s.to_string())
            .collect();
        let partition = match state.partition() {
            StatePartition::Entry => "entry",
            StatePartition::Working => "working",
            StatePartition::WaitingForHuman => "waiting",
            StatePartition::Decision => "decision",
            StatePartition::Terminal => "terminal",
        };
        if next.is_empty() {
            println!("{state:<28} {partition:<9} (terminal)");
        } else {
            println!("{state:<28} {partition:<9} -> {}", next.join(", "));
        }
    }
}
