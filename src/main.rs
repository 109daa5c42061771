use clap::{Parser, Subcommand};
use proofsheet::imaging::RustBackend;
use proofsheet::types::JobKind;
use proofsheet::{JobEngine, config, logging, output};
use serde::Serialize;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

fn version_string() -> &'static str {
    let on_tag = env!("PROOFSHEET_RELEASE_TAG");
    if on_tag == "true" {
        env!("CARGO_PKG_VERSION")
    } else {
        let hash = env!("PROOFSHEET_GIT_HASH");
        if hash.is_empty() {
            "dev@unknown"
        } else {
            // Leaked once at startup — trivial, called exactly once
            Box::leak(format!("dev@{hash}").into_boxed_str())
        }
    }
}

#[derive(Parser)]
#[command(name = "proofsheet")]
#[command(about = "Background preview and archive jobs for photo libraries")]
#[command(long_about = "\
Background preview and archive jobs for photo libraries

Requests name a configured source and a path inside it. Preview requests
queue one job per eligible file; archive requests queue a single ZIP job.
Workers (`proofsheet work`) claim jobs from the shared SQLite queue, and
any number of worker processes may run against the same database.

Preview files land at a fixed location:

  <cache_dir>/<source>/<size>/<relative path>.jpg

so a client can check for a cached preview without asking the queue.

Typical session:

  proofsheet enqueue main albumA --size 750
  proofsheet work --once
  proofsheet status main albumA --size 750
  proofsheet archive main albumA/IMG_1.CR2 albumA/IMG_2.CR2
  proofsheet archive-status <token>
  proofsheet download <token>

Run 'proofsheet gen-config' to generate a documented proofsheet.toml.")]
#[command(version = version_string())]
struct Cli {
    /// Config file
    #[arg(long, default_value = "proofsheet.toml", global = true)]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging for proofsheet itself (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run workers against the job queue
    Work {
        /// Exit once no claimable job is left
        #[arg(long)]
        once: bool,
    },
    /// Queue preview jobs for a file or every eligible file under a folder
    Enqueue {
        source: String,
        path: String,
        /// Longer edge in pixels, or a configured variant name
        #[arg(long)]
        size: String,
    },
    /// Show cache state under a folder
    Status {
        source: String,
        #[arg(default_value = "")]
        folder: String,
        /// Restrict to one size (required with --file)
        #[arg(long)]
        size: Option<String>,
        /// Also report these files (relative to the source)
        #[arg(long = "file")]
        files: Vec<String>,
    },
    /// Queue a ZIP archive of files and folders
    Archive {
        source: String,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Show progress of an archive job
    ArchiveStatus { token: String },
    /// Fetch a finished archive; the server copy is deleted afterwards
    Download {
        token: String,
        /// Destination file (defaults to <token>.zip)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Count jobs by state
    Jobs,
    /// Fail every pending and processing job of a kind
    Cancel {
        #[arg(value_enum)]
        kind: JobKind,
    },
    /// Delete failed job rows
    ClearFailed,
    /// Delete rows whose preview or archive file is gone
    Cleanup,
    /// Time out stale jobs and purge expired archives
    Reconcile,
    /// Print a stock proofsheet.toml with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let engine = JobEngine::open(config::load_config(&cli.config)?)?;
    let json = cli.json;

    match cli.command {
        Command::Work { once } => {
            let (tx, rx) = std::sync::mpsc::channel();
            let printer = std::thread::spawn(move || {
                for event in rx {
                    if !json {
                        output::print_lines(&output::format_worker_event(&event));
                    }
                }
            });
            let stats = {
                let pool = engine.worker_pool(RustBackend::new())?.with_events(tx);
                if once {
                    pool.run_until_idle()?
                } else {
                    // Runs until the process is killed
                    let shutdown = AtomicBool::new(false);
                    pool.run(&shutdown)?
                }
            };
            printer.join().map_err(|_| "event printer panicked")?;
            emit(json, &stats, output::format_run_stats(&stats))?;
        }
        Command::Enqueue { source, path, size } => {
            let report = engine.enqueue_cache(&source, &path, &size)?;
            emit(json, &report, output::format_cache_enqueue(&source, &path, &report))?;
        }
        Command::Status {
            source,
            folder,
            size,
            files,
        } => {
            let report = engine.cache_status(&source, &folder, size.as_deref(), &files)?;
            emit(json, &report, output::format_cache_status(&report))?;
        }
        Command::Archive { source, paths } => {
            let outcome = engine.enqueue_archive(&source, &paths)?;
            emit(json, &outcome, output::format_archive_enqueue(&outcome))?;
        }
        Command::ArchiveStatus { token } => {
            let job = engine.archive_status(&token)?;
            emit(json, &job, output::format_archive_status(&job))?;
        }
        Command::Download { token, output: dest } => {
            let dest = dest.unwrap_or_else(|| PathBuf::from(format!("{token}.zip")));
            // Refuse before creating the destination file
            engine.status().archive_ready(&token)?;
            let mut file = BufWriter::new(std::fs::File::create(&dest)?);
            let download = match engine.download_archive(&token, &mut file) {
                Ok(download) => download,
                Err(e) => {
                    drop(file);
                    let _ = std::fs::remove_file(&dest);
                    return Err(e.into());
                }
            };
            let shown = dest.display().to_string();
            emit(json, &download, output::format_download(&download, &shown))?;
        }
        Command::Jobs => {
            let counts = [JobKind::Cache, JobKind::Archive]
                .into_iter()
                .map(|kind| engine.job_counts(kind).map(|counts| (kind, counts)))
                .collect::<Result<Vec<_>, _>>()?;
            emit(json, &counts, output::format_job_counts(&counts))?;
        }
        Command::Cancel { kind } => {
            let report = engine.cancel_active_jobs(kind)?;
            emit(json, &report, output::format_cancel(&report))?;
        }
        Command::ClearFailed => {
            let removed = engine.clear_failed_jobs()?;
            emit(json, &removed, output::format_removed("Cleared failed jobs", &removed))?;
        }
        Command::Cleanup => {
            let removed = engine.cleanup_orphaned_records()?;
            emit(json, &removed, output::format_removed("Removed orphaned records", &removed))?;
        }
        Command::Reconcile => {
            let report = engine.reconcile()?;
            emit(json, &report, output::format_reconcile(&report))?;
        }
        // Printed before the engine opens
        Command::GenConfig => {}
    }

    Ok(())
}

/// Print `value` as pretty JSON, or the formatted lines.
fn emit(
    json: bool,
    value: &impl Serialize,
    lines: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        output::print_lines(&lines);
    }
    Ok(())
}
