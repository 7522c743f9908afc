use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use ai_data_collector::config::{get_config_path, AppConfig, ConfigOverrides};
use ai_data_collector::logging::{init_logging, LogContext, RequestIdGenerator};
use ai_data_collector::storage::SessionStatus;
use ai_data_collector::utils::{format_duration, format_file_size, truncate_string};
use ai_data_collector::{
    CancellationHandle, CollectOptions, CollectionPlan, CollectionReport, DataCollector, ExportFormat,
};

#[derive(Parser)]
#[command(name = "adc")]
#[command(about = "AI Data Collector command line interface")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collection plan in a new session
    Collect {
        #[arg(help = "Path to the plan YAML file")]
        plan: PathBuf,

        #[arg(short, long, help = "Output base path")]
        output: Option<PathBuf>,

        #[arg(short, long = "format", help = "Output format (repeatable)")]
        formats: Vec<ExportFormat>,

        #[arg(long, help = "Session name")]
        name: Option<String>,
    },

    /// Continue an interrupted session from its last checkpoint
    Resume {
        #[arg(help = "Session ID")]
        session_id: String,

        #[arg(short, long, help = "Output base path")]
        output: Option<PathBuf>,
    },

    /// Validate a plan file without collecting
    Validate {
        #[arg(help = "Path to the plan YAML file")]
        plan: PathBuf,
    },

    /// Inspect or delete sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Export a session's records
    Export {
        #[arg(help = "Session ID")]
        session_id: String,

        #[arg(short, long, help = "Output file path")]
        output: PathBuf,

        #[arg(short, long, help = "Output format")]
        format: ExportFormat,
    },

    /// Show the metrics of a session's last run
    Metrics {
        #[arg(help = "Session ID")]
        session_id: String,
    },

    /// Write an example plan
    InitPlan {
        #[arg(default_value = "plan.yaml")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List recent sessions
    List {
        #[arg(short, long, default_value_t = 20, help = "Number of sessions to show")]
        limit: usize,
    },

    /// Show details of a session
    Show {
        #[arg(help = "Session ID")]
        session_id: String,
    },

    /// Delete a session and everything collected in it
    Delete {
        #[arg(help = "Session ID")]
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that need neither config nor storage
    if let Commands::InitPlan { path } = &cli.command {
        return init_plan(path).await;
    }

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = AppConfig::load_from_file(path).await?;
            ConfigOverrides::apply(&mut config);
            config.validate()?;
            config
        }
        None => AppConfig::load().await?,
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    init_logging(&config.logging)?;

    let context = LogContext::new("main", "startup")
        .with_request_id(RequestIdGenerator::generate())
        .with_string_field("version", env!("CARGO_PKG_VERSION"))
        .with_string_field(
            "config",
            cli.config.clone().unwrap_or_else(get_config_path).display().to_string(),
        );
    ai_data_collector::log_info!(context, "AI Data Collector starting up");

    let collector = DataCollector::new(config).await?;

    match cli.command {
        Commands::Collect {
            plan,
            output,
            formats,
            name,
        } => {
            let plan = CollectionPlan::from_file(&plan)?;
            let options = CollectOptions {
                session_name: name,
                output_path: output,
                formats,
                cancellation: Some(cancel_on_ctrl_c()),
                skip_export: false,
            };
            let report = collector.collect(plan, options).await?;
            print_report(&report);
        }
        Commands::Resume { session_id, output } => {
            let options = CollectOptions {
                output_path: output,
                cancellation: Some(cancel_on_ctrl_c()),
                ..CollectOptions::default()
            };
            let report = collector.resume(&session_id, options).await?;
            print_report(&report);
        }
        Commands::Validate { plan } => validate_plan(&collector, &plan)?,
        Commands::Sessions { command } => match command {
            SessionCommands::List { limit } => list_sessions(&collector, limit).await?,
            SessionCommands::Show { session_id } => show_session(&collector, &session_id).await?,
            SessionCommands::Delete { session_id } => {
                if collector.delete_session(&session_id).await? {
                    println!("Session {} deleted.", session_id);
                } else {
                    println!("Session {} not found.", session_id);
                }
            }
        },
        Commands::Export {
            session_id,
            output,
            format,
        } => {
            let stats = collector.export_session(&session_id, &output, format).await?;
            println!(
                "Session {} exported: {} records to {} ({})",
                session_id,
                stats.record_count,
                stats.file_path.display(),
                format_file_size(stats.file_size_bytes)
            );
        }
        Commands::Metrics { session_id } => match collector.session_metrics(&session_id).await? {
            Some(snapshot) => {
                println!("Metrics for session {}:", session_id);
                for line in snapshot.summary_lines() {
                    println!("  {}", line);
                }
            }
            None => println!("No metrics recorded for session {}.", session_id),
        },
        Commands::InitPlan { .. } => {}
    }

    Ok(())
}

/// First Ctrl-C stops the run at the next batch boundary
fn cancel_on_ctrl_c() -> CancellationHandle {
    let handle = CancellationHandle::new();
    let trigger = handle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupt received, stopping after the current batch");
                trigger.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });
    handle
}

async fn init_plan(path: &Path) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    tokio::fs::write(path, CollectionPlan::example().to_yaml()?).await?;
    println!("Example plan written to {}", path.display());
    Ok(())
}

fn validate_plan(collector: &DataCollector, path: &Path) -> Result<()> {
    let plan = CollectionPlan::from_file(path)?;
    let report = collector.security().generate_security_report(&plan);

    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for note in &report.info {
        println!("info: {}", note);
    }

    match collector.validate_plan(&plan) {
        Ok(()) => {
            println!("Plan '{}' is valid.", plan.name);
            Ok(())
        }
        Err(e) => {
            for err in &report.errors {
                println!("error: {}", err);
            }
            error!("Plan validation failed: {}", e);
            Err(e)
        }
    }
}

async fn list_sessions(collector: &DataCollector, limit: usize) -> Result<()> {
    let sessions = collector.list_sessions(limit).await?;

    println!("Recent collection sessions:");
    println!(
        "{:<36} {:<20} {:<12} {:>7} {:>9} {:<20}",
        "Session ID", "Name", "Status", "Pages", "Records", "Updated"
    );
    println!("{}", "-".repeat(109));

    for session in sessions {
        println!(
            "{:<36} {:<20} {:<12} {:>7} {:>9} {:<20}",
            session.id,
            truncate_string(&session.name, 20),
            session.status.to_string(),
            session.pages_visited,
            session.records_collected,
            session.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn show_session(collector: &DataCollector, session_id: &str) -> Result<()> {
    let Some(session) = collector.get_session(session_id).await? else {
        println!("Session {} not found.", session_id);
        return Ok(());
    };

    println!("Session Details:");
    println!("ID: {}", session.id);
    println!("Name: {}", session.name);
    println!("Status: {}", session.status);
    println!("Created: {}", session.created_at);
    println!("Updated: {}", session.updated_at);
    println!("Pages visited: {}", session.pages_visited);
    println!("Records collected: {}", session.records_collected);
    println!("Failures: {}", session.failures);
    if let Some(error) = &session.last_error {
        println!("Last error: {}", error);
    }

    let failed = collector.sessions().failed_pages(session_id).await?;
    if !failed.is_empty() {
        println!("\nFailed pages:");
        for page in failed.iter().take(20) {
            println!("  {} - {}", page.url, truncate_string(&page.error, 80));
        }
    }

    println!("\nPlan:");
    println!("{}", session.plan_yaml);
    Ok(())
}

fn print_report(report: &CollectionReport) {
    info!("Session {} finished with status {}", report.session_id, report.status);

    println!("Session: {} ({})", report.session_id, report.session_name);
    println!("Status: {}", report.status);
    println!(
        "Pages: {} visited, {} failed; records: {} collected, {} exported",
        report.pages_visited, report.pages_failed, report.records_collected, report.records_exported
    );
    for stage in &report.stage_info {
        println!(
            "  {:<14} {:>7} -> {:<7} {}ms",
            stage.name, stage.items_in, stage.items_out, stage.duration_ms
        );
    }
    for export in &report.exports {
        println!(
            "Exported {} records to {} ({})",
            export.record_count,
            export.file_path.display(),
            format_file_size(export.file_size_bytes)
        );
    }
    if let Some(metrics) = &report.metrics {
        for line in metrics.summary_lines() {
            println!("  {}", line);
        }
    }
    println!("Duration: {}", format_duration(report.duration));

    if report.status == SessionStatus::Interrupted {
        println!("Resume with: adc resume {}", report.session_id);
    }
}
