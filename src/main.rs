use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use ledger_tools::config::LedgerConfig;
use ledger_tools::io::database::Database;
use ledger_tools::model::EntityKind;
use ledger_tools::progress::{CancelToken, ProgressController, ProgressStatus};
use ledger_tools::session::Session;
use ledger_tools::worker::run_with_progress;
use ledger_tools::{LedgerError, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();
    if let Err(error) = init_tracing().and_then(|()| run(cli)) {
        eprintln!("error: {error}");
        if let Some(diff) = error.diff() {
            eprint!("{diff}");
        }
        std::process::exit(1);
    }
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| LedgerError::Logging(err.to_string()))
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }

    let mut session = Session::new(config);
    match cli.command {
        Command::Init(args) => execute_init(&args),
        Command::Summary(args) => execute_summary(&mut session, args),
        Command::Backup(args) => execute_backup(&mut session, &args),
        Command::Restore(args) => execute_restore(&mut session, &args),
    }
}

fn execute_init(args: &InitArgs) -> Result<()> {
    Database::open(&args.db)?.create_schema()?;
    info!(db = %args.db.display(), "schema ready");
    Ok(())
}

fn execute_summary(session: &mut Session, args: SummaryArgs) -> Result<()> {
    match (args.db, args.backup) {
        (Some(db), _) => load_database(session, &db)?,
        (None, Some(backup)) => {
            let interval = session.config().report_interval;
            run_with_progress(
                CancelToken::new(),
                interval,
                |ctl| session.restore_backup(&backup, ctl),
                log_status,
            )?;
        }
        (None, None) => {
            return Err(LedgerError::Config(
                "summary needs --db or --backup".to_string(),
            ));
        }
    }

    let data = session.data();
    for kind in EntityKind::INSERT_ORDER {
        println!("{:<14}{}", kind.sheet_name(), data.count(kind));
    }
    println!("{:<14}{:?}", "State", data.edit_state());
    Ok(())
}

fn execute_backup(session: &mut Session, args: &BackupArgs) -> Result<()> {
    load_database(session, &args.db)?;
    let interval = session.config().report_interval;
    let session = &*session;
    run_with_progress(
        CancelToken::new(),
        interval,
        |ctl| session.create_backup(&args.output, ctl),
        log_status,
    )?;
    info!(output = %args.output.display(), "backup written");
    Ok(())
}

fn execute_restore(session: &mut Session, args: &RestoreArgs) -> Result<()> {
    let interval = session.config().report_interval;
    run_with_progress(
        CancelToken::new(),
        interval,
        |ctl| session.restore_backup(&args.input, ctl),
        log_status,
    )?;

    let mut db = Database::open(&args.db)?;
    db.create_schema()?;
    run_with_progress(
        CancelToken::new(),
        interval,
        |ctl| session.restore_into_database(&mut db, ctl),
        log_status,
    )?;
    info!(db = %args.db.display(), "restore complete");
    Ok(())
}

fn load_database(session: &mut Session, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(LedgerError::MissingInput(path.to_path_buf()));
    }
    let db = Database::open(path)?;
    let interval = session.config().report_interval;
    run_with_progress(
        CancelToken::new(),
        interval,
        move |ctl: &mut ProgressController| session.load_database(&db, ctl),
        log_status,
    )
}

fn log_status(status: &ProgressStatus) {
    info!("{status}");
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Maintain a personal ledger database and its verified workbook backups."
)]
struct Cli {
    /// JSON file with batch and progress settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Statements per commit; zero or less commits once at the end.
    #[arg(long, global = true, allow_negative_numbers = true)]
    batch_size: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ledger tables in a database.
    Init(InitArgs),
    /// Print item counts for a database or a backup workbook.
    Summary(SummaryArgs),
    /// Write a verified workbook backup of a database.
    Backup(BackupArgs),
    /// Replace a database's contents with a backup workbook.
    Restore(RestoreArgs),
}

#[derive(Args)]
struct InitArgs {
    /// SQLite database path.
    #[arg(long)]
    db: PathBuf,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SummaryArgs {
    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Backup workbook path.
    #[arg(long)]
    backup: Option<PathBuf>,
}

#[derive(Args)]
struct BackupArgs {
    /// SQLite database to back up.
    #[arg(long)]
    db: PathBuf,

    /// Workbook to create; must not exist yet.
    #[arg(long)]
    output: PathBuf,
}

#[derive(Args)]
struct RestoreArgs {
    /// Backup workbook to read.
    #[arg(long)]
    input: PathBuf,

    /// SQLite database to overwrite.
    #[arg(long)]
    db: PathBuf,
}
