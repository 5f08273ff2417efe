use clap::{Parser, Subcommand};
use dbbench::{
    config::RunnerConfig,
    database::{BenchmarkJob, Storage},
    host,
    sync::{signal, Cancellation},
    system::System,
};
use std::{path::PathBuf, process::exit};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_unwrap::ResultExt;

/// Distributed benchmark runner comparing database engines
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// runner configuration
    #[arg(short, long, default_value = "dbbench.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// poll the ledger and run benchmarks until interrupted
    Run,
    /// enqueue a benchmark of one revision on one dataset
    Submit {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        branch: String,
        #[arg(long)]
        revision: String,
        #[arg(long)]
        dataset: String,
    },
    /// list all benchmarks in the ledger
    Status,
}

fn main() {
    let cancellation = Cancellation::new();
    // has to happen before any other thread exists
    if let Err(error) = signal::listen(cancellation.clone()) {
        eprintln!("Failed to install signal listener: {error}");
        exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match RunnerConfig::load(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            error!(config = ?cli.config, "Failed to load config: {error}");
            exit(1);
        }
    };

    match cli.command {
        Commands::Run => {
            host::pin(&config.executor.cores).expect_or_log("Failed to pin runner");

            let system = System::load(&config).expect_or_log("Failed to start runner");
            system.run(&cancellation);
        }
        Commands::Submit {
            repo,
            branch,
            revision,
            dataset,
        } => {
            if !config.datasets.iter().any(|known| known.name == dataset) {
                warn!(dataset = %dataset, "Dataset is not configured for this runner");
            }

            let ledger = Storage::load(&config.database)
                .and_then(|storage| storage.ledger())
                .expect_or_log("Failed to open ledger");
            let job = BenchmarkJob::new(&repo, &branch, &revision, &dataset);

            ledger.submit(&job).expect_or_log("Failed to submit benchmark");
        }
        Commands::Status => {
            let jobs = Storage::load(&config.database)
                .and_then(|storage| storage.ledger())
                .and_then(|ledger| ledger.jobs())
                .expect_or_log("Failed to read ledger");

            for job in jobs {
                let state = match (job.finished, job.is_claimed()) {
                    (true, _) => "finished",
                    (false, true) => "running",
                    (false, false) => "pending",
                };

                println!("{state:<8} {job} {}", job.results);
            }
        }
    }
}
