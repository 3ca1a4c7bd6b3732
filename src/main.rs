use std::io;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use knob_tuner::cli::{Cli, Command};
use knob_tuner::config::AppConfig;
use knob_tuner::gateway::{ConnectionRegistry, GatewayService, Heartbeat};
use knob_tuner::tuning::bus::{EventBus, EventSink};
use knob_tuner::tuning::catalog::build_schema;
use knob_tuner::web::{self, AppState};
use knob_tuner::{KnobSchema, Orchestrator, TuneResult};

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| match &config.logging.filter {
            Some(directive) => EnvFilter::try_new(directive),
            None => EnvFilter::try_new("info"),
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

fn print_banner(config: &AppConfig, schema: &KnobSchema) {
    eprintln!("{}", "KNOB TUNER".bright_cyan().bold());
    eprintln!("{}", "=".repeat(50).bright_blue());
    eprintln!(
        "{}: {} knobs across {} modules",
        "Schema".bright_yellow(),
        schema.len().to_string().bright_white(),
        schema.modules().len()
    );
    eprintln!(
        "{}: ws://{}/ws/<subject>",
        "Gateway".bright_yellow(),
        config.listen_addr()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
}

fn print_knobs(schema: &KnobSchema) {
    let mut current_module = "";
    for d in schema.iter() {
        if d.module != current_module {
            current_module = &d.module;
            println!("{}", d.module.bright_cyan().bold());
        }
        println!(
            "  {:<28} {:>8} [{}, {}] {} {}",
            d.name.bright_white(),
            format!("{:.3}", d.default).bright_green(),
            d.min,
            d.max,
            d.unit.as_deref().unwrap_or("").bright_magenta(),
            d.description.dimmed()
        );
    }
    println!("{}", format!("{} knobs", schema.len()).bright_yellow());
}

async fn run(config: AppConfig, schema: KnobSchema) -> TuneResult<()> {
    let gateway_config = config.gateway();
    let connections = Arc::new(ConnectionRegistry::new(gateway_config.queue_capacity));
    let bus = Arc::new(EventBus::new(vec![connections.clone() as Arc<dyn EventSink>]));
    let orchestrator = Orchestrator::start(config.orchestrator(), Arc::new(schema), bus);
    let maintenance = orchestrator.start_maintenance();
    let heartbeat = Heartbeat::start(
        Arc::clone(&connections),
        gateway_config.heartbeat_interval,
        gateway_config.stale_after,
    );
    let gateway =
        Arc::new(GatewayService::new(Arc::clone(&orchestrator), connections, gateway_config));
    let state = Arc::new(AppState { orchestrator: Arc::clone(&orchestrator), gateway });

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
    };
    let served = web::serve(listener, state, shutdown).await;

    heartbeat.stop().await;
    maintenance.stop().await;
    orchestrator.shutdown().await;
    info!("stopped");
    served
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Command::Completions { shell } = cli.selected() {
        clap_complete::generate(shell, &mut Cli::command(), "knob-tuner", &mut io::stdout());
        return Ok(());
    }

    let config = AppConfig::resolve(&cli)?;
    let schema = build_schema(config.server.builtin_knobs, config.knobs.clone())?;

    match cli.selected() {
        Command::Knobs => print_knobs(&schema),
        _ => {
            init_tracing(&config);
            print_banner(&config, &schema);
            run(config, schema).await?;
        }
    }
    Ok(())
}
