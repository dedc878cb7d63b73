use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use memql::{Config, Engine, MemoryStore, Validator};

fn print_help() {
    println!(
        "\
memql v{}

Runs untrusted Lua scripts against a persistent memory store, inside a
validated, resource-limited sandbox. The result is printed as JSON.

USAGE:
    memql [OPTIONS] [SCRIPT_PATH]

ARGUMENTS:
    SCRIPT_PATH    Path to the Lua script to run [default: read from stdin]

OPTIONS:
    -c, --config PATH    Path to TOML configuration file
                         [default: config/memql.toml]
    --validate           Validate the script and print the report without
                         executing it
    -h, --help           Print this help message and exit
    -V, --version        Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing (e.g. debug, memql=debug,warn)

EXAMPLES:
    memql query.lua                      # run a script file
    echo 'return 1 + 1' | memql          # run a script from stdin
    memql --validate query.lua           # static checks only
    RUST_LOG=debug memql query.lua       # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path: Option<String> = None;
    let mut script_path: Option<String> = None;
    let mut validate_only = false;

    // Hand-rolled argument loop; the surface is small enough
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("memql v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(
                    args.next()
                        .context("--config requires a path argument")?,
                );
            }
            "--validate" => validate_only = true,
            other if other.starts_with('-') => {
                anyhow::bail!("unknown option '{other}' (see --help)");
            }
            other => script_path = Some(other.to_string()),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("memql=info")),
        )
        .init();

    // Load configuration; a missing default file means built-in defaults
    let config = match config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            Config::load(&path)?
        }
        None if Path::new("config/memql.toml").exists() => {
            info!("Loading configuration from config/memql.toml");
            Config::load("config/memql.toml")?
        }
        None => Config::default(),
    };

    let source = match script_path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading script {path}"))?,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("reading script from stdin")?;
            buffer
        }
    };

    let validator = Validator::new(config.validator.strict_loops);

    if validate_only {
        let report = validator.validate(&source);
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.valid {
            std::process::exit(1);
        }
        return Ok(());
    }

    let store = Arc::new(MemoryStore::open(&config.store.path)?);
    let engine = Engine::new(store, validator, config.limits.resource_limits());
    let result = engine.execute(&source).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
