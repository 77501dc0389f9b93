mod cli;
mod config;
mod platform;
mod serve;
mod storage;

use std::sync::Arc;

use crate::cli::{Command, ConfigCommand};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use securekv_core::{
    dispatch::{Dispatcher, Method, MethodCall, MethodOutcome},
    storage::Executor,
};
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const HEALTH_PROBE_KEY: &str = "securekv.health/probe";

/// Entry point wiring the CLI to the method-call facade.
#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?.with_overrides(cli.namespace, cli.backend);
    run_command(cli.command.unwrap_or(Command::Serve), &config).await
}

fn init_tracing() {
    // Stdout carries results and the serve protocol, so logs go to stderr.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("securekv {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn build_dispatcher(config: &config::Config) -> Result<Arc<Dispatcher>> {
    let provider = storage::provider_from_config(config)?;
    let executor = Arc::new(Executor::new(provider));
    Ok(Arc::new(Dispatcher::new(
        executor,
        platform::platform_version(),
    )))
}

async fn run_command(command: Command, config: &config::Config) -> Result<()> {
    match command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(config)?,
        Command::Platform => {
            let dispatcher = build_dispatcher(config)?;
            let version = call(&dispatcher, Method::GetPlatformVersion, Value::Null).await?;
            println!("{}", version.as_str().unwrap_or_default());
        }
        Command::Write { key, value } => {
            let dispatcher = build_dispatcher(config)?;
            call(&dispatcher, Method::Write, json!({ "key": key, "value": value })).await?;
        }
        Command::Read { key } => {
            let dispatcher = build_dispatcher(config)?;
            match call(&dispatcher, Method::Read, json!({ "key": key })).await? {
                Value::String(value) => println!("{value}"),
                _ => eprintln!("no value stored for {key}"),
            }
        }
        Command::Delete { key } => {
            let dispatcher = build_dispatcher(config)?;
            call(&dispatcher, Method::Delete, json!({ "key": key })).await?;
        }
        Command::Call { method, args } => {
            let dispatcher = build_dispatcher(config)?;
            let arguments = match args {
                Some(raw) => serde_json::from_str(&raw)?,
                None => Value::Null,
            };
            let outcome = serve::dispatch(&dispatcher, MethodCall::new(method, arguments)).await?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Command::Serve => {
            let dispatcher = build_dispatcher(config)?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            serve::run(dispatcher, stdin, tokio::io::stdout()).await?;
        }
        Command::Health => {
            let dispatcher = build_dispatcher(config)?;
            run_store_health(&dispatcher).await?;
            println!("Storage ({}): ok", dispatcher.executor().backend_name());
        }
    }
    Ok(())
}

/// Dispatch a typed call and lift anything but success into an error.
async fn call(dispatcher: &Arc<Dispatcher>, method: Method, arguments: Value) -> Result<Value> {
    let outcome = serve::dispatch(dispatcher, MethodCall::new(method.as_str(), arguments)).await?;
    match outcome {
        MethodOutcome::Success { result } => Ok(result),
        MethodOutcome::Error { code, message, .. } => Err(eyre!("{code}: {message}")),
        MethodOutcome::NotImplemented => Err(eyre!("{} is not implemented", method.as_str())),
    }
}

async fn run_store_health(dispatcher: &Arc<Dispatcher>) -> Result<()> {
    let payload = "ok";
    call(
        dispatcher,
        Method::Write,
        json!({ "key": HEALTH_PROBE_KEY, "value": payload }),
    )
    .await?;
    let round_trip = call(dispatcher, Method::Read, json!({ "key": HEALTH_PROBE_KEY })).await?;
    call(dispatcher, Method::Delete, json!({ "key": HEALTH_PROBE_KEY })).await?;

    if round_trip.as_str() != Some(payload) {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}
