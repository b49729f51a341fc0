use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use statement_ledger::db::{get_events_for_run, latest_run_id, status_counts};
use statement_ledger::discovery::{load_manifest, scan_sources};
use statement_ledger::{
    fingerprint_file, open_connection, EventRecorder, Observers, Pipeline, PipelineConfig,
    StatusLogObserver, TracingObserver,
};

const USAGE: &str = "usage:
  statement-ledger ingest [--config PATH] [--manifest FILE]
  statement-ledger status [--config PATH]
  statement-ledger fingerprint FILE";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        Some("ingest") => run_ingest(&args[1..]),
        Some("status") => run_status(&args[1..]),
        Some("fingerprint") => run_fingerprint(&args[1..]),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

/// `--config` and `--manifest` values; anything else is an error
struct Flags {
    config: Option<PathBuf>,
    manifest: Option<PathBuf>,
}

fn parse_flags(args: &[String]) -> Result<Flags> {
    let mut flags = Flags {
        config: None,
        manifest: None,
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let slot = match arg.as_str() {
            "--config" => &mut flags.config,
            "--manifest" => &mut flags.manifest,
            other => bail!("unexpected argument '{}'\n{}", other, USAGE),
        };
        let value = iter
            .next()
            .with_context(|| format!("{} needs a value", arg))?;
        *slot = Some(PathBuf::from(value));
    }
    Ok(flags)
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn run_ingest(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let config = PipelineConfig::load(flags.config.as_deref())?;
    init_tracing(&config.log_filter);

    println!("📥 Statement Ledger - ingest");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    // 1. Jobs
    let jobs = match &flags.manifest {
        Some(manifest) => load_manifest(manifest)?,
        None => scan_sources(&config.sources, &config.processed_dir_name)?,
    };
    if jobs.is_empty() {
        println!("✓ Nothing to ingest");
        return Ok(());
    }
    println!("📂 {} documents found", jobs.len());

    // 2. Observers for this run
    let run_id = uuid::Uuid::new_v4().to_string();
    let events_conn = open_connection(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    let mut observers = Observers::new()
        .with(TracingObserver)
        .with(EventRecorder::new(run_id.clone(), events_conn));
    if let Some(path) = &config.status_log_path {
        let log = StatusLogObserver::open(path)
            .with_context(|| format!("Failed to open status log {}", path.display()))?;
        observers = observers.with(log);
    }

    // 3. Run
    let pipeline = Pipeline::from_config(&config);
    let summary = pipeline
        .run_batch(&config.database_path, &jobs, &observers)
        .context("Ingestion run aborted")?;

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🔖 Run {}", run_id);
    println!("✓ {}", summary.summary());

    if summary.failed() > 0 {
        eprintln!("❌ {} documents need attention:", summary.failed());
        for outcome in summary.outcomes.iter().filter(|o| o.state.is_failure()) {
            eprintln!(
                "   {} ({})",
                outcome.status_line(),
                outcome.reason.as_deref().unwrap_or("no reason recorded")
            );
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_status(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let config = PipelineConfig::load(flags.config.as_deref())?;
    init_tracing(&config.log_filter);

    if !config.database_path.exists() {
        eprintln!("❌ Database not found: {}", config.database_path.display());
        eprintln!("   Run: statement-ledger ingest");
        std::process::exit(1);
    }

    let conn = open_connection(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;

    println!("📊 Documents in {}", config.database_path.display());
    let counts = status_counts(&conn)?;
    if counts.is_empty() {
        println!("   (none)");
    }
    for (status, count) in counts {
        println!("   {:<10} {}", status, count);
    }

    if let Some(run_id) = latest_run_id(&conn)? {
        let events = get_events_for_run(&conn, &run_id)?;
        println!("\n🔖 Last run {} ({} documents)", run_id, events.len());
        for event in events {
            println!(
                "   {} | {} | {}",
                event.file_name,
                event.fingerprint.as_deref().unwrap_or("-"),
                event.status
            );
        }
    }

    Ok(())
}

fn run_fingerprint(args: &[String]) -> Result<()> {
    let [file] = args else {
        bail!("{}", USAGE);
    };
    let path = Path::new(file);
    let fingerprint =
        fingerprint_file(path).with_context(|| format!("Failed to read {}", path.display()))?;
    println!("{}  {}", fingerprint, path.display());
    Ok(())
}
