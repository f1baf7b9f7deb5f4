//! schedarray — entry point.
//!
//! Tracing logs go to stderr; stdout carries command output only. Under
//! `--json` the default log filter drops to `error` so stdout/stderr stay
//! machine-readable.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "schedarray")]
#[command(about = "Cross-platform batch job scheduler", long_about = None)]
struct Cli {
    /// Path to the scheduler database (default: auto-detect).
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Output in JSON format.
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Submit a job (like sbatch).
    Submit {
        /// Script file to execute.
        #[arg(long, short = 's')]
        script: Option<String>,

        /// Command to execute.
        #[arg(long, short = 'c')]
        command: Option<String>,

        /// Job name.
        #[arg(long, short = 'J')]
        job_name: Option<String>,

        /// Working directory.
        #[arg(long, short = 'd')]
        working_dir: Option<String>,

        /// Number of CPUs.
        #[arg(long, short = 'n', default_value_t = 1)]
        cpus: i64,

        /// Memory limit (e.g., 4G).
        #[arg(long, short = 'm')]
        memory: Option<String>,

        /// Timeout in seconds.
        #[arg(long, short = 't')]
        timeout: Option<i64>,

        /// Job priority (higher runs sooner).
        #[arg(long, short = 'p', default_value_t = 0)]
        priority: i64,

        /// Output file.
        #[arg(long, short = 'o')]
        output: Option<String>,

        /// Error file.
        #[arg(long, short = 'e')]
        error: Option<String>,
    },

    /// Show job status (like squeue).
    Status {
        /// Job ID.
        job_id: String,
    },

    /// List jobs (like squeue).
    List {
        /// Filter by state.
        #[arg(long, short = 's')]
        state: Option<String>,

        /// Filter by user.
        #[arg(long, short = 'u')]
        user: Option<String>,

        /// Limit number of jobs.
        #[arg(long, short = 'n')]
        limit: Option<i64>,
    },

    /// Show job counts by state.
    Counts,

    /// Cancel a job (like scancel).
    Cancel {
        /// Job ID.
        job_id: String,
    },

    /// Delete a terminal job.
    Delete {
        /// Job ID.
        job_id: String,
    },

    /// Clean up old/completed jobs.
    Cleanup {
        /// Delete completed jobs.
        #[arg(long)]
        completed: bool,

        /// Delete failed jobs.
        #[arg(long)]
        failed: bool,

        /// Delete cancelled jobs.
        #[arg(long)]
        cancelled: bool,

        /// Delete timed-out jobs.
        #[arg(long)]
        timeout: bool,

        /// Only delete jobs that finished more than N days ago.
        #[arg(long)]
        older_than_days: Option<i64>,
    },

    /// Manage the scheduler service.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ServiceCommand {
    /// Run the dispatcher in the foreground.
    Start {
        /// Maximum workers (default: CPU count).
        #[arg(long)]
        max_workers: Option<usize>,

        /// Poll interval in seconds.
        #[arg(long, default_value_t = 1.0)]
        poll_interval: f64,
    },

    /// Show a service snapshot.
    Status,

    /// Stop the service.
    Stop,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.json {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    // Logs always go to stderr so stdout stays parseable.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if cli.json {
                let doc = serde_json::json!({ "error": format!("{e:#}") });
                println!("{doc}");
            }
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let db_path = cli.db_path.as_deref();
    let json = cli.json;

    match &cli.command {
        Command::Submit {
            script,
            command,
            job_name,
            working_dir,
            cpus,
            memory,
            timeout,
            priority,
            output,
            error,
        } => schedarray::submit::execute(schedarray::submit::SubmitOpts {
            db_path,
            json,
            script: script.as_deref(),
            command: command.as_deref(),
            job_name: job_name.as_deref(),
            working_dir: working_dir.as_deref(),
            cpus: *cpus,
            memory: memory.as_deref(),
            timeout: *timeout,
            priority: *priority,
            output: output.as_deref(),
            error: error.as_deref(),
        }),

        Command::Status { job_id } => schedarray::status::execute(schedarray::status::StatusOpts {
            db_path,
            json,
            job_id,
        }),

        Command::List { state, user, limit } => {
            schedarray::list::execute(schedarray::list::ListOpts {
                db_path,
                json,
                state: state.as_deref(),
                user: user.as_deref(),
                limit: *limit,
            })
        }

        Command::Counts => {
            schedarray::counts::execute(schedarray::counts::CountsOpts { db_path, json })
        }

        Command::Cancel { job_id } => schedarray::cancel::execute(schedarray::cancel::CancelOpts {
            db_path,
            json,
            job_id,
        }),

        Command::Delete { job_id } => schedarray::delete::execute(schedarray::delete::DeleteOpts {
            db_path,
            json,
            job_id,
        }),

        Command::Cleanup {
            completed,
            failed,
            cancelled,
            timeout,
            older_than_days,
        } => schedarray::cleanup::execute(schedarray::cleanup::CleanupOpts {
            db_path,
            json,
            completed: *completed,
            failed: *failed,
            cancelled: *cancelled,
            timeout: *timeout,
            older_than_days: *older_than_days,
        }),

        Command::Service { command } => match command {
            ServiceCommand::Start {
                max_workers,
                poll_interval,
            } => schedarray::service_cmd::start(schedarray::service_cmd::StartOpts {
                db_path,
                max_workers: *max_workers,
                poll_interval: *poll_interval,
            }),
            ServiceCommand::Status => {
                schedarray::service_cmd::status(schedarray::service_cmd::StatusOpts {
                    db_path,
                    json,
                    max_workers: None,
                })
            }
            ServiceCommand::Stop => {
                schedarray::service_cmd::stop(schedarray::service_cmd::StatusOpts {
                    db_path,
                    json,
                    max_workers: None,
                })
            }
        },
    }
}
