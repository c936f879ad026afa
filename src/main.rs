//! modelgate entry point.
//!
//! ## CLI Subcommands
//!
//! - `modelgate` or `modelgate serve` - run the gateway (default)
//! - `modelgate models` - print the catalog
//! - `modelgate config show` - print the effective configuration
//! - `modelgate version` - print the version

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use modelgate::catalog::ModelCatalog;
use modelgate::config;
use modelgate::engine::detect_engines;
use modelgate::server::run_server;
use modelgate::telemetry::init_logging;
use modelgate::{Gateway, GatewayConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("serve");

    match command {
        "serve" | "" => run_serve().await,
        "models" => run_models(),
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    let cfg = config::load();
                    match serde_json::to_string_pretty(&cfg.effective_config()) {
                        Ok(json) => {
                            println!("{json}");
                            ExitCode::SUCCESS
                        }
                        Err(e) => {
                            eprintln!("failed to render config: {e}");
                            ExitCode::FAILURE
                        }
                    }
                }
                _ => {
                    eprintln!("Unknown config subcommand: {subcommand}");
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "version" | "--version" | "-V" => {
            println!("modelgate {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

async fn run_serve() -> ExitCode {
    let cfg = config::load();

    if let Err(e) = init_logging(&cfg.log) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    let catalog = match ModelCatalog::load_file(&cfg.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            tracing::error!(error = %e, "failed to load model catalog");
            return ExitCode::FAILURE;
        }
    };
    if catalog.is_empty() {
        tracing::warn!(
            path = %cfg.catalog_path.display(),
            "catalog is empty; every request will fail with model-not-found"
        );
    }

    let mut engines = detect_engines(&cfg.native);
    engines.set_default_preference(cfg.engine);
    tracing::info!(engines = ?engines.kinds(), models = catalog.len(), "gateway starting");

    let gateway = Arc::new(Gateway::new(
        GatewayConfig {
            ledger: cfg.ledger.clone(),
            acquire_timeout: cfg.acquire_timeout,
            health_interval: cfg.health_interval,
            shutdown_timeout: cfg.shutdown_timeout,
        },
        catalog,
        engines,
    ));

    let reporter = gateway.spawn_health_reporter();

    let addr: SocketAddr = match format!("{}:{}", cfg.host, cfg.port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(host = %cfg.host, port = cfg.port, error = %e, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };

    let result = run_server(gateway, addr).await;
    reporter.abort();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

fn run_models() -> ExitCode {
    let cfg = config::load();
    match ModelCatalog::load_file(&cfg.catalog_path) {
        Ok(catalog) => {
            let mut models = catalog.list();
            models.sort_by(|a, b| a.name.cmp(&b.name));
            for model in models {
                println!(
                    "{}\t{}\t{} bytes\t{}",
                    model.name,
                    model.engine.as_str(),
                    model.cost_bytes,
                    model.path.display()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to load catalog: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("modelgate - local OpenAI-compatible model gateway");
    println!();
    println!("USAGE:");
    println!("    modelgate [COMMAND]");
    println!();
    println!("COMMANDS:");
    println!("    serve          Run the gateway (default)");
    println!("    models         Print the model catalog");
    println!("    config show    Print the effective configuration");
    println!("    version        Print the version");
    println!("    help           Show this message");
    println!();
    println!("Configuration is read from MODELGATE_* environment variables;");
    println!("run `modelgate config show` for the effective values.");
}
