// crates/dflowcli/src/main.rs

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dflowcore::{Checkpoint, FlowEvent, StepError, Value};
use dflowruntime::{Engine, EngineConfig, Flow};
use dflowstores::{InMemoryContextStore, InMemoryCounterStore, TokioDelayScheduler};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dflow")]
#[command(about = "Durable flow engine CLI", long_about = None)]
struct Cli {
    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the approval demo: start, suspend at the callback, resume
    Run {
        /// Trace id of the demo instance
        #[arg(short, long, default_value = "t1")]
        trace: String,

        /// Payload delivered with the approval callback
        #[arg(short, long, default_value = "approved")]
        payload: String,
    },

    /// Run the zip demo with a delayed branch
    Zip {
        #[arg(short, long, default_value = "z1")]
        trace: String,

        /// Delay of the slow branch in milliseconds
        #[arg(short, long, default_value_t = 100)]
        delay_ms: u64,
    },

    /// Print the routing table of the demo pipelines
    Routes,

    /// Pretty-print a dumped checkpoint
    Inspect {
        /// Path to a checkpoint JSON file
        #[arg(short, long)]
        file: PathBuf,
    },
}

fn approval_flow() -> Flow {
    Flow::just(5)
        .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) * 2)))
        .await_call("approve")
        .id("approve")
        .name("approval")
        .map(|_, v| Ok(json!(v.as_i64().unwrap_or(0) + 1)))
}

fn zip_flow(delay_ms: u64) -> Flow {
    let fast = Flow::just(3).map(|cp, v| {
        cp.put("fast", true)?;
        Ok(v)
    });
    let slow = Flow::just(4).delay_for(delay_ms);
    Flow::zip(vec![fast, slow], |_, values| {
        let sum: i64 = values.iter().filter_map(Value::as_i64).sum();
        if values.len() != 2 {
            return Err(StepError::user("expected two values"));
        }
        Ok(json!(sum))
    })
    .name("sum")
}

fn engine(scheduler: Option<TokioDelayScheduler>) -> Engine {
    let builder = Engine::builder(
        Arc::new(InMemoryContextStore::new()),
        Arc::new(InMemoryCounterStore::new()),
    )
    .config(EngineConfig::from_env());
    match scheduler {
        Some(scheduler) => builder.delay_scheduler(Arc::new(scheduler)).build(),
        None => builder.build(),
    }
}

/// Print events as they happen until the flow finishes.
fn print_events(mut events: broadcast::Receiver<FlowEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                FlowEvent::StepStarted { trace_id, step, .. } => {
                    println!("  ▶  [{}] {}", trace_id, step);
                }
                FlowEvent::StepCompleted { step, duration_ms, .. } => {
                    println!("  ✅ {} completed in {}ms", step, duration_ms);
                }
                FlowEvent::StepFailed { step, error, .. } => {
                    println!("  ❌ {} failed: {}", step, error);
                }
                FlowEvent::Suspended { step, .. } => {
                    println!("  ⏸  waiting in {}", step);
                }
                FlowEvent::Forwarded { machine, .. } => {
                    println!("  ↪  forwarded to {}", machine);
                }
                FlowEvent::FlowFinished { trace_id, failed, .. } => {
                    if failed {
                        println!("💥 {} finished in failure", trace_id);
                    } else {
                        println!("✨ {} finished", trace_id);
                    }
                }
            }
        }
    })
}

fn print_checkpoint(cp: &Checkpoint) -> Result<()> {
    println!("📋 Checkpoint {}", cp.id);
    for (key, value) in &cp.global {
        println!("   {} = {}", key, value);
    }
    for frame in &cp.stack {
        let ret = frame
            .ret
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {:<40} {:<16} param={} ret={}",
            frame.debug_name.as_deref().unwrap_or(&frame.name),
            frame.status.to_string(),
            frame.param,
            ret
        );
    }
    println!();
    println!("{}", serde_json::to_string_pretty(cp)?);
    Ok(())
}

async fn run_approval(trace: String, payload: String) -> Result<()> {
    let engine = engine(None);
    let pipeline = engine.install(&approval_flow(), "demo").await?;
    println!("🚀 Pipeline {} (entry {})", pipeline.name, pipeline.entry);

    let printer = print_events(engine.subscribe_events());

    engine.start(&pipeline, &trace).await?;
    if let Some(cp) = engine.checkpoint(&trace).await? {
        let waiting = cp.top().map(|f| f.param.to_string()).unwrap_or_default();
        println!("   suspended with param {}", waiting);
    }

    engine.resume("approve", &payload, &trace).await?;

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    printer.abort();

    let cp = engine
        .checkpoint(&trace)
        .await?
        .context("checkpoint disappeared")?;
    println!();
    print_checkpoint(&cp)
}

async fn run_zip(trace: String, delay_ms: u64) -> Result<()> {
    let (scheduler, timers) = TokioDelayScheduler::new();
    let engine = engine(Some(scheduler));
    let pipeline = engine.install(&zip_flow(delay_ms), "zip").await?;

    let mut finished = engine.subscribe_events();
    let printer = print_events(engine.subscribe_events());
    let driver = engine.clone();
    let drive = tokio::spawn(async move { driver.drive(timers).await });

    engine.start(&pipeline, &trace).await?;

    let wait = async {
        while let Ok(event) = finished.recv().await {
            if matches!(&event, FlowEvent::FlowFinished { trace_id, .. } if trace_id == &trace) {
                break;
            }
        }
    };
    tokio::time::timeout(tokio::time::Duration::from_millis(delay_ms + 5_000), wait)
        .await
        .context("zip demo did not finish")?;

    tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    printer.abort();
    drive.abort();

    let cp = engine
        .checkpoint(&trace)
        .await?
        .context("checkpoint disappeared")?;
    println!();
    print_checkpoint(&cp)
}

async fn list_routes() -> Result<()> {
    let engine = engine(None);
    for (name, flow) in [("demo", approval_flow()), ("zip", zip_flow(100))] {
        let pipeline = engine.install(&flow, name).await?;
        println!("📦 {} entry={} terminal={}", pipeline.name, pipeline.entry, pipeline.terminal);
    }
    println!();
    for route in engine.router().routes().await {
        let slot = route.slot.map(|s| format!(" slot {}", s)).unwrap_or_default();
        println!("  • {} -> {}{}", route.call_type, route.step, slot);
    }
    println!();
    for name in engine.router().step_names().await {
        if let Some(step) = engine.router().step(&name).await {
            println!("  {:<40} {:<10} next={:?}", step.name, step.kind_name(), step.next);
        }
    }
    Ok(())
}

fn inspect(file: PathBuf) -> Result<()> {
    let dumped = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let cp = Checkpoint::rebuild(&dumped)?;
    print_checkpoint(&cp)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();

    match cli.command {
        Commands::Run { trace, payload } => run_approval(trace, payload).await?,
        Commands::Zip { trace, delay_ms } => run_zip(trace, delay_ms).await?,
        Commands::Routes => list_routes().await?,
        Commands::Inspect { file } => inspect(file)?,
    }

    Ok(())
}
