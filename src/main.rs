// src/main.rs
//
// =============================================================================
// LABFLOW: COMMANDER & ENTRY POINT
// =============================================================================
//
// CLI for the lab controller, running against the simulated lab. Embedding
// programs with real hardware use the library directly and register their
// own drivers.
//
// Modes:
// 1. INIT:    Provision the database with the registered devices/positions.
// 2. START:   Run the control loop (compiler + scheduler + close-out).
// 3. SUBMIT / STATUS / CANCEL / PAUSE / RESUME / REQUESTS / RESPOND:
//    Operator commands; they talk to the same database from any process.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use labflow::core::ExperimentSubmission;
use labflow::lab::{Lab, LabConfig};
use labflow::sim::{build_simulated_lab, demo_experiment};
use std::sync::atomic::Ordering;
use tokio::signal;
use uuid::Uuid;

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "labflow", version, about = "Autonomous lab task orchestrator")]
struct Cli {
    /// Path to the lab database.
    #[arg(long, default_value = "labflow.db")]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision the database with the registered devices and positions.
    Init,

    /// Run the lab control loop until interrupted.
    Start {
        /// Scheduler tick interval in milliseconds.
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
    },

    /// Submit an experiment document (JSON).
    Submit {
        /// Path to the experiment file.
        #[arg(long, conflicts_with = "demo")]
        file: Option<String>,

        /// Submit the built-in demo experiment instead.
        #[arg(long)]
        demo: bool,
    },

    /// Print devices, experiments, tasks and pending operator requests.
    Status,

    /// Request cancellation of a task or a whole experiment.
    Cancel {
        #[arg(long, conflicts_with = "experiment")]
        task: Option<Uuid>,

        #[arg(long)]
        experiment: Option<Uuid>,
    },

    /// Pause a device (takes effect when its current task finishes).
    Pause {
        #[arg(long)]
        device: String,
    },

    /// Lift a device pause.
    Resume {
        #[arg(long)]
        device: String,
    },

    /// List pending operator-input requests.
    Requests,

    /// Answer a pending operator-input request.
    Respond {
        #[arg(long)]
        request: Uuid,

        #[arg(long)]
        answer: String,
    },
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = LabConfig::new(&cli.db);
    if let Commands::Start { tick_ms } = &cli.command {
        config.tick_interval = std::time::Duration::from_millis(*tick_ms);
    }
    let lab = Lab::open(config, build_simulated_lab()?).context("opening the lab database")?;

    match cli.command {
        Commands::Init => {
            lab.setup()?;
            println!("lab database provisioned at {}", cli.db);
        }
        Commands::Start { .. } => run_controller(lab).await?,
        Commands::Submit { file, demo } => {
            let submission = load_submission(file, demo)?;
            let id = lab.submit_experiment(submission)?;
            println!("accepted experiment {id}");
        }
        Commands::Status => print_status(&lab)?,
        Commands::Cancel { task, experiment } => match (task, experiment) {
            (Some(task), _) => {
                lab.request_task_cancellation(task)?;
                println!("cancellation requested for task {task}");
            }
            (None, Some(experiment)) => {
                lab.request_experiment_cancellation(experiment)?;
                println!("cancellation requested for experiment {experiment}");
            }
            (None, None) => anyhow::bail!("pass --task or --experiment"),
        },
        Commands::Pause { device } => {
            lab.pause_device(&device)?;
            println!("pause requested for {device}");
        }
        Commands::Resume { device } => {
            lab.resume_device(&device)?;
            println!("{device} resumed");
        }
        Commands::Requests => {
            for request in lab.pending_requests()? {
                println!(
                    "{}  {}  [{}]",
                    request.id,
                    request.prompt,
                    request.options.join(" | ")
                );
            }
        }
        Commands::Respond { request, answer } => {
            lab.respond(request, &answer)?;
            println!("answered {request}: {answer}");
        }
    }
    Ok(())
}

// ============================================================================
// 3. RUNTIME
// ============================================================================

async fn run_controller(lab: Lab) -> Result<()> {
    let shutdown = lab.shutdown_handle();
    tokio::spawn(async move {
        signal::ctrl_c().await.ok();
        log::warn!("interrupt received, stopping after the current tick");
        shutdown.store(true, Ordering::SeqCst);
    });
    lab.run().await?;
    Ok(())
}

fn load_submission(file: Option<String>, demo: bool) -> Result<ExperimentSubmission> {
    if demo {
        return Ok(demo_experiment());
    }
    let path = file.context("pass --file <experiment.json> or --demo")?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {path}"))
}

fn print_status(lab: &Lab) -> Result<()> {
    let snapshot = lab.snapshot()?;

    println!("DEVICES");
    for device in &snapshot.devices {
        println!(
            "  {:<14} {:<10} {:<10} pause={:<10} {}",
            device.name,
            device.type_name,
            device.status.as_str(),
            device.pause_status.as_str(),
            device.message
        );
    }

    println!("EXPERIMENTS");
    for experiment in &snapshot.experiments {
        println!(
            "  {}  {:<10} {} ({} task(s))",
            experiment.id,
            experiment.status.as_str(),
            experiment.name,
            experiment.tasks.len()
        );
    }

    println!("TASKS");
    for task in &snapshot.tasks {
        println!(
            "  {}  {:<21} {:<10} {}",
            task.id,
            task.status.as_str(),
            task.type_name,
            task.message
        );
    }

    println!("SAMPLES");
    for sample in &snapshot.samples {
        println!(
            "  {}  {:<12} at {}",
            sample.id,
            sample.name,
            sample.position.as_deref().unwrap_or("(off-lab)")
        );
    }

    if !snapshot.pending_requests.is_empty() {
        println!("PENDING OPERATOR REQUESTS");
        for request in &snapshot.pending_requests {
            println!(
                "  {}  {}  [{}]",
                request.id,
                request.prompt,
                request.options.join(" | ")
            );
        }
    }
    Ok(())
}
