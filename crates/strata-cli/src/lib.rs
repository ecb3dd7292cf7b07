//! # Strata CLI
//!
//! Command-line harness for the strata runtime.
//!
//! ## Commands
//! - `run` - Simulate a population of moving, decaying entities
//! - `dump` - Write a generated population as JSON lines
//! - `load` - Read JSON lines back into a registry and summarize it
//! - `config` - Print the effective registry configuration

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use strata_ecs::{Registry, RegistryConfig, System, SystemContext, SystemFn, SystemResult, TickOutcome};

/// Strata runtime CLI
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Registry configuration file (JSON)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Simulate a population for a number of ticks
    Run {
        /// Number of entities to spawn
        #[arg(short, long, default_value = "1000")]
        entities: usize,

        /// Number of ticks to run
        #[arg(short, long, default_value = "60")]
        ticks: u64,

        /// Fork-join worker threads (0 = one per core)
        #[arg(long)]
        threads: Option<usize>,

        /// Milliseconds between ticks; ticks back to back when omitted
        #[arg(long)]
        period: Option<u64>,
    },

    /// Generate a population and write it as JSON lines
    Dump {
        /// Number of entities to generate
        #[arg(short, long, default_value = "10")]
        entities: usize,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Load JSON lines into a registry and print a summary
    Load {
        /// Input file
        input: PathBuf,
    },

    /// Print the effective registry configuration
    Config,
}

/// Spatial position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Linear velocity per second
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Velocity {
    pub x: f32,
    pub y: f32,
}

/// Hit points; the entity is reaped at zero
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health(pub u32);

/// Outcome counts of a simulation run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub survivors: usize,
}

/// Registry with the demo component codecs registered
pub fn demo_registry(config: RegistryConfig) -> Arc<Registry> {
    let registry = Arc::new(Registry::new(config));
    registry.register_component::<Position>("strata::Position");
    registry.register_component::<Velocity>("strata::Velocity");
    registry.register_component::<Health>("strata::Health");
    registry
}

/// Spawn `count` entities; every third one also has health
pub fn populate(registry: &Registry, count: usize) {
    for i in 0..count {
        let position = Position { x: i as f32, y: 0.0 };
        let velocity = Velocity { x: 1.0, y: (i % 7) as f32 };
        if i % 3 == 0 {
            registry.emplace((position, velocity, Health(3 + (i % 5) as u32)));
        } else {
            registry.emplace((position, velocity));
        }
    }
}

struct Movement;

impl System for Movement {
    fn run(&self, ctx: &SystemContext) -> SystemResult {
        let dt = ctx.delta_time().as_secs_f32();
        ctx.registry().view::<(Position, Velocity)>().par_for_each(|entry| {
            let (position, velocity) = entry.components();
            position.x += velocity.x * dt;
            position.y += velocity.y * dt;
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "movement"
    }
}

fn decay(ctx: &SystemContext) -> SystemResult {
    ctx.registry().view::<(Health,)>().par_for_each(|entry| {
        let (health,) = entry.components();
        health.0 = health.0.saturating_sub(1);
    });
    Ok(())
}

fn reap(ctx: &SystemContext) -> SystemResult {
    let registry = ctx.registry();
    let mut reaped = 0;
    registry.view::<(Health,)>().for_each(|entry| {
        let (health,) = entry.components();
        if health.0 == 0 && registry.destroy(entry.entity()) {
            reaped += 1;
        }
    });
    if reaped > 0 {
        log::debug!("Tick {}: reaping {} entities", ctx.tick(), reaped);
    }
    Ok(())
}

/// Run the demo simulation for `ticks` ticks
pub fn simulate(registry: &Arc<Registry>, ticks: u64, period: Option<Duration>) -> Result<RunSummary> {
    let scheduler = registry.create_scheduler()?;
    let cluster: Vec<Box<dyn System>> = vec![Box::new(Movement), Box::new(SystemFn::new("decay", decay))];
    scheduler.schedule_parallel(cluster);
    scheduler.schedule_fn("reap", reap);

    let mut summary = RunSummary::default();
    for _ in 0..ticks {
        match scheduler.update() {
            TickOutcome::Completed => summary.completed += 1,
            TickOutcome::Failed => summary.failed += 1,
            TickOutcome::TimedOut => summary.timed_out += 1,
            TickOutcome::ShutDown => break,
        }
        if let Some(period) = period {
            std::thread::sleep(period);
        }
    }

    if !scheduler.shutdown() {
        log::warn!("Scheduler did not shut down cleanly");
    }
    summary.survivors = registry.entity_count();
    Ok(summary)
}

/// Serialize every entity holding a position, one JSON document per line
pub fn dump_documents(registry: &Registry) -> Result<String> {
    let entities = registry.view::<(Position,)>().entities();
    let mut out = String::new();
    for document in registry.par_serialize(&entities) {
        out.push_str(&document?);
        out.push('\n');
    }
    Ok(out)
}

/// Deserialize JSON lines into `registry`, failing on the first bad line
pub fn load_documents(registry: &Registry, source: &str) -> Result<usize> {
    let lines: Vec<&str> = source.lines().filter(|line| !line.trim().is_empty()).collect();
    for (number, result) in registry.par_deserialize(&lines).into_iter().enumerate() {
        result.with_context(|| format!("line {}", number + 1))?;
    }
    Ok(lines.len())
}

fn load_config(path: Option<&Path>) -> Result<RegistryConfig> {
    match path {
        Some(path) => {
            let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            RegistryConfig::from_json(&source).with_context(|| format!("parsing {}", path.display()))
        }
        None => Ok(RegistryConfig::default()),
    }
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { entities, ticks, threads, period } => {
            if let Some(threads) = threads {
                config = config.with_worker_threads(threads);
            }
            let registry = demo_registry(config);
            populate(&registry, entities);
            log::info!("Running {} ticks over {} entities...", ticks, entities);

            let summary = simulate(&registry, ticks, period.map(Duration::from_millis))?;
            log::info!(
                "  Ticks: {} completed, {} failed, {} timed out",
                summary.completed,
                summary.failed,
                summary.timed_out
            );
            log::info!("  Survivors: {}", summary.survivors);
            print!("{}", registry);
            registry.close();
        }

        Commands::Dump { entities, output } => {
            let registry = demo_registry(config);
            populate(&registry, entities);
            let documents = dump_documents(&registry)?;
            match output {
                Some(path) => {
                    fs::write(&path, documents).with_context(|| format!("writing {}", path.display()))?;
                    log::info!("Wrote {} entities to {}", entities, path.display());
                }
                None => io::stdout().write_all(documents.as_bytes())?,
            }
        }

        Commands::Load { input } => {
            let source = fs::read_to_string(&input).with_context(|| format!("reading {}", input.display()))?;
            let registry = demo_registry(config);
            let loaded = load_documents(&registry, &source)?;
            log::info!("Loaded {} entities from {}", loaded, input.display());
            print!("{}", registry);
        }

        Commands::Config => {
            println!("{:#?}", config);
        }
    }

    Ok(())
}
