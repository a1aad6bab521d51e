//! Binary entry point for the Lineage administrative CLI.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use lineage::session::{ChainEntry, Identity, ReadlockScan, SessionConfig};
use lineage::{CommitReport, LineageError, SessionManager};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[path = "lineage/ui.rs"]
mod ui;

use ui::{Mark, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "lineage",
    version,
    about = "Administrative CLI for Lineage session databases",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, help = "Shorthand for --format json")]
    json: bool,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Theme::Auto,
        help = "Colour theme for text output"
    )]
    theme: Theme,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create a new database directory")]
    Init {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, help = "Database name (at most 32 bytes)")]
        name: String,

        #[arg(long, help = "Block size in bytes")]
        block_size: Option<usize>,

        #[arg(long, help = "Generations kept above the tip before retirement")]
        keep_alive: Option<u32>,
    },

    #[command(about = "Show the committed superblock and lock state")]
    Status {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "List processes holding readlocks")]
    Readers {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Show who holds the write lock")]
    Lock {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },

    #[command(about = "Commit an empty session and run retirement")]
    Commit {
        #[arg(value_name = "DB")]
        db_path: PathBuf,

        #[arg(long, help = "Title recorded on the new session")]
        title: Option<String>,

        #[arg(long, help = "Exempt the new session from retirement")]
        permanent: bool,
    },

    #[command(about = "Dump every session record with its generation")]
    Chain {
        #[arg(value_name = "DB")]
        db_path: PathBuf,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
struct InitReport {
    path: String,
    name: String,
    session: u64,
    block_size: usize,
    keep_alive: u32,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    path: String,
    name: String,
    session: u64,
    schema_version: u32,
    block_size: u32,
    byte_order: String,
    global_table: u64,
    lock_holder: Option<String>,
    readers: usize,
    live_sessions: usize,
    destroyed_sessions: usize,
    keep_alive: u32,
}

#[derive(Debug, Serialize)]
struct LockReport {
    locked: bool,
    session: Option<u64>,
    holder: Option<String>,
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        let contention = err
            .downcast_ref::<LineageError>()
            .is_some_and(LineageError::is_contention);
        std::process::exit(if contention { 2 } else { 1 });
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let format = if cli.json {
        OutputFormat::Json
    } else {
        cli.format
    };
    let ui = Ui::new(cli.theme);

    match cli.command {
        Command::Init {
            db_path,
            name,
            block_size,
            keep_alive,
        } => {
            let report = init(&db_path, &name, block_size, keep_alive)?;
            emit(&format, &report, |_| {
                ui.success(&format!(
                    "created {:?} at {} (session {})",
                    report.name, report.path, report.session
                ))
            })?;
        }
        Command::Status { db_path } => {
            let report = status(&db_path)?;
            emit(&format, &report, |_| print_status_text(&ui, &report))?;
        }
        Command::Readers { db_path } => {
            let scan = readers(&db_path)?;
            emit(&format, &scan, |_| print_readers_text(&ui, &scan))?;
        }
        Command::Lock { db_path } => {
            let report = lock(&db_path)?;
            emit(&format, &report, |_| match &report.holder {
                Some(holder) => ui.warn(&format!(
                    "locked by {holder} (session {})",
                    report.session.unwrap_or_default()
                )),
                None => ui.success("unlocked"),
            })?;
        }
        Command::Commit {
            db_path,
            title,
            permanent,
        } => {
            let report = commit(&db_path, title, permanent)?;
            emit(&format, &report, |_| print_commit_text(&ui, &report))?;
        }
        Command::Chain { db_path } => {
            let entries = chain(&db_path)?;
            emit(&format, &entries, |_| print_chain_text(&ui, &entries))?;
        }
    }

    Ok(())
}

fn init(
    path: &Path,
    name: &str,
    block_size: Option<usize>,
    keep_alive: Option<u32>,
) -> Result<InitReport, LineageError> {
    let mut config = SessionConfig::load_from_dir(path)?;
    if let Some(block_size) = block_size {
        config.block_size = block_size;
    }
    if let Some(keep_alive) = keep_alive {
        config.keep_alive = keep_alive;
    }
    let db = SessionManager::builder(path).config(config).create(name)?;
    let report = InitReport {
        path: path.display().to_string(),
        name: db.superblock().name.clone(),
        session: db.committed_session().0,
        block_size: db.config().block_size,
        keep_alive: db.config().keep_alive,
    };
    db.close()?;
    Ok(report)
}

fn status(path: &Path) -> Result<StatusReport, LineageError> {
    let mut db = SessionManager::open(path)?;
    let holder = db.lock_holder()?;
    let scan = other_readers(&mut db)?;
    let entries = db.chain()?.entries();
    let live_sessions = entries.iter().filter(|e| e.live).count();
    let sb = db.superblock();
    let report = StatusReport {
        path: path.display().to_string(),
        name: sb.name.clone(),
        session: sb.session.0,
        schema_version: sb.schema_version,
        block_size: sb.block_size,
        byte_order: format!("{:?}", sb.byte_order).to_lowercase(),
        global_table: sb.global_table.0,
        lock_holder: holder.map(|h| h.to_string()),
        readers: scan.active.len(),
        live_sessions,
        destroyed_sessions: entries.len() - live_sessions,
        keep_alive: db.config().keep_alive,
    };
    db.close()?;
    Ok(report)
}

/// Scans the registry without this process's own marker.
fn other_readers(db: &mut SessionManager) -> Result<ReadlockScan, LineageError> {
    let me: Identity = db.identity().clone();
    let mut scan = db.readers()?;
    scan.active
        .retain(|e| !(e.pid == me.pid && e.host == me.host));
    Ok(scan)
}

fn readers(path: &Path) -> Result<ReadlockScan, LineageError> {
    let mut db = SessionManager::open(path)?;
    let scan = other_readers(&mut db)?;
    db.close()?;
    Ok(scan)
}

fn lock(path: &Path) -> Result<LockReport, LineageError> {
    let db = SessionManager::open(path)?;
    let holder = db.lock_holder()?;
    db.close()?;
    Ok(LockReport {
        locked: holder.is_some(),
        session: holder.as_ref().map(|h| h.session.0),
        holder: holder.map(|h| h.identity),
    })
}

fn commit(
    path: &Path,
    title: Option<String>,
    permanent: bool,
) -> Result<CommitReport, LineageError> {
    let mut db = SessionManager::open(path)?;
    db.begin_write()?;
    if let Some(title) = title {
        db.set_title(title)?;
    }
    if permanent {
        db.mark_permanent()?;
    }
    let report = db.commit()?;
    db.end_write()?;
    db.close()?;
    Ok(report)
}

fn chain(path: &Path) -> Result<Vec<ChainEntry>, LineageError> {
    let db = SessionManager::open(path)?;
    let entries = db.chain()?.entries();
    db.close()?;
    Ok(entries)
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_status_text(ui: &Ui, report: &StatusReport) {
    ui.section(
        "Superblock",
        [
            ("name", report.name.clone()),
            ("session", report.session.to_string()),
            ("schema", report.schema_version.to_string()),
            ("block size", report.block_size.to_string()),
            ("byte order", report.byte_order.clone()),
            ("global table", report.global_table.to_string()),
        ],
    );
    ui.section(
        "Sessions",
        [
            ("live", report.live_sessions.to_string()),
            ("destroyed", report.destroyed_sessions.to_string()),
            ("keep alive", report.keep_alive.to_string()),
            ("readers", report.readers.to_string()),
            (
                "lock",
                report
                    .lock_holder
                    .clone()
                    .unwrap_or_else(|| "unlocked".to_string()),
            ),
        ],
    );
}

fn print_readers_text(ui: &Ui, scan: &ReadlockScan) {
    print!("{}", scan.report());
    if !scan.expired.is_empty() {
        ui.warn(&format!("removed {} expired marker(s)", scan.expired.len()));
    }
}

fn print_commit_text(ui: &Ui, report: &CommitReport) {
    ui.success(&format!(
        "committed session {} on {}",
        report.session, report.parent
    ));
    ui.sessions(
        "Retired",
        report
            .retired
            .iter()
            .map(|s| (Mark::Destroyed, format!("session {s}"))),
    );
    if report.released_blocks > 0 {
        ui.success(&format!("released {} block(s)", report.released_blocks));
    }
    if let Some(err) = &report.retire_error {
        ui.warn(&format!("retirement stopped early: {err}"));
    }
    ui.sessions(
        "Protected by readers",
        report
            .protected
            .iter()
            .map(|s| (Mark::Protected, format!("session {s}"))),
    );
}

fn print_chain_text(ui: &Ui, entries: &[ChainEntry]) {
    ui.sessions(
        "Sessions",
        entries.iter().map(|e| {
            let (mark, state) = match e.destroyed_by {
                Some(by) => (Mark::Destroyed, format!("destroyed by {by}")),
                None if e.permanent => (Mark::Permanent, format!("gen {} permanent", e.generation)),
                None => (Mark::Live, format!("gen {}", e.generation)),
            };
            let up = e
                .up_link
                .map(|u| format!(" up {u}"))
                .unwrap_or_default();
            let title = e
                .title
                .as_deref()
                .map(|t| format!(" {t:?}"))
                .unwrap_or_default();
            let row = format!(
                "{:>6} {state}{up} +{}/-{}{title}",
                e.number, e.plus_blocks, e.minus_blocks
            );
            (mark, row)
        }),
    );
}
