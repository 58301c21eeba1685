//! Diagnostic harness for lynxdb environments.
//!
//! Everything here goes through the public API: it is a convenience for
//! poking at a database from the shell, not a second code path into the
//! engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use eyre::{bail, Context, Result};
use lynxdb::{DbFlags, Env, EnvFlags, EnvOptions, WriteFlags};

#[derive(Parser, Debug)]
#[command(name = "lynx")]
#[command(about = "Inspect and edit lynxdb environments")]
#[command(version)]
struct Args {
    /// Environment directory (or data file with --no-subdir)
    #[arg(short, long)]
    path: PathBuf,

    /// Map size in MiB for environments created by this invocation
    #[arg(long, default_value = "64")]
    map_size_mib: usize,

    /// Treat the path as the data file itself
    #[arg(long)]
    no_subdir: bool,

    /// Named database to operate on (default: the main database)
    #[arg(short, long)]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print environment information
    Info,
    /// Print statistics of the selected database
    Stat,
    /// Get the value stored under a key
    Get { key: String },
    /// Store a key/value pair
    Put { key: String, value: String },
    /// Delete a key
    Del { key: String },
    /// List all entries in key order
    Scan {
        /// Stop after this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Walk the newest snapshot and check structural invariants
    Verify,
    /// List registered readers and clear slots of dead processes
    Readers,
    /// Copy the environment (page-exact, or compacted with --compact)
    Copy {
        target: PathBuf,
        #[arg(long)]
        compact: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    let mut flags = EnvFlags::empty();
    if args.no_subdir {
        flags |= EnvFlags::NO_SUB_DIR;
    }
    let read_only = matches!(
        args.command,
        Command::Info | Command::Stat | Command::Get { .. } | Command::Scan { .. }
    );
    if read_only && data_file_exists(&args) {
        flags |= EnvFlags::READ_ONLY;
    }

    let env = EnvOptions::new()
        .map_size(args.map_size_mib << 20)
        .flags(flags)
        .open(&args.path)
        .wrap_err_with(|| format!("failed to open environment at {}", args.path.display()))?;

    match args.command {
        Command::Info => info(&env),
        Command::Stat => stat(&env, args.db.as_deref()),
        Command::Get { key } => get(&env, args.db.as_deref(), &key),
        Command::Put { key, value } => put(&env, args.db.as_deref(), &key, &value),
        Command::Del { key } => del(&env, args.db.as_deref(), &key),
        Command::Scan { limit } => scan(&env, args.db.as_deref(), limit),
        Command::Verify => verify(&env),
        Command::Readers => readers(&env),
        Command::Copy { target, compact } => {
            env.copy_to(&target, compact)?;
            println!("copied to {}", target.display());
            Ok(())
        }
    }
}

fn data_file_exists(args: &Args) -> bool {
    if args.no_subdir {
        args.path.exists()
    } else {
        args.path.join("data.lynx").exists()
    }
}

fn info(env: &Env) -> Result<()> {
    let info = env.info()?;
    println!("map size:      {} bytes", info.map_size);
    println!("last pgno:     {}", info.last_pgno);
    println!("last txnid:    {}", info.last_txnid);
    println!("max readers:   {}", info.max_readers);
    println!("readers used:  {}", info.num_readers);
    Ok(())
}

fn stat(env: &Env, db: Option<&str>) -> Result<()> {
    let mut txn = env.begin_ro_txn()?;
    let dbi = txn.open_db(db, DbFlags::empty())?;
    let stat = txn.db_stat(dbi)?;
    println!("page size:      {}", stat.page_size);
    println!("tree depth:     {}", stat.depth);
    println!("branch pages:   {}", stat.branch_pages);
    println!("leaf pages:     {}", stat.leaf_pages);
    println!("overflow pages: {}", stat.overflow_pages);
    println!("entries:        {}", stat.entries);
    Ok(())
}

fn get(env: &Env, db: Option<&str>, key: &str) -> Result<()> {
    let mut txn = env.begin_ro_txn()?;
    let dbi = txn.open_db(db, DbFlags::empty())?;
    match txn.get(dbi, key.as_bytes())? {
        Some(value) => {
            println!("{}", String::from_utf8_lossy(value));
            Ok(())
        }
        None => bail!("key not found: {key}"),
    }
}

fn put(env: &Env, db: Option<&str>, key: &str, value: &str) -> Result<()> {
    let mut txn = env.begin_rw_txn()?;
    let dbi = txn.open_db(db, DbFlags::CREATE)?;
    txn.put(dbi, key.as_bytes(), value.as_bytes(), WriteFlags::empty())?;
    txn.commit()?;
    Ok(())
}

fn del(env: &Env, db: Option<&str>, key: &str) -> Result<()> {
    let mut txn = env.begin_rw_txn()?;
    let dbi = txn.open_db(db, DbFlags::empty())?;
    txn.del(dbi, key.as_bytes(), None)?;
    txn.commit()?;
    Ok(())
}

fn scan(env: &Env, db: Option<&str>, limit: Option<usize>) -> Result<()> {
    let mut txn = env.begin_ro_txn()?;
    let dbi = txn.open_db(db, DbFlags::empty())?;
    let mut cursor = txn.cursor(dbi)?;
    let mut entry = cursor.first()?;
    let mut printed = 0usize;
    while let Some((key, value)) = entry {
        println!(
            "{}\t{}",
            String::from_utf8_lossy(key),
            String::from_utf8_lossy(value)
        );
        printed += 1;
        if limit.is_some_and(|limit| printed >= limit) {
            break;
        }
        entry = cursor.next()?;
    }
    eprintln!("{printed} entries");
    Ok(())
}

fn verify(env: &Env) -> Result<()> {
    let report = env.verify()?;
    println!("snapshot txnid:  {}", report.txnid);
    println!("last pgno:       {}", report.last_pgno);
    println!("branch pages:    {}", report.branch_pages);
    println!("leaf pages:      {}", report.leaf_pages);
    println!("overflow pages:  {}", report.overflow_pages);
    println!("free-list pages: {}", report.free_list_pages);
    println!("entries:         {}", report.entries);
    println!("unreferenced:    {}", report.unreferenced);
    if report.unreferenced > 0 {
        bail!("{} unreferenced pages (leak)", report.unreferenced);
    }
    println!("ok");
    Ok(())
}

fn readers(env: &Env) -> Result<()> {
    for reader in env.reader_list() {
        let txnid = if reader.txnid == u64::MAX {
            "idle".to_string()
        } else {
            reader.txnid.to_string()
        };
        println!(
            "slot {:3}  pid {:7}  tid {:#x}  txnid {}",
            reader.slot, reader.pid, reader.tid, txnid
        );
    }
    let dead = env.reader_check()?;
    println!("cleared {dead} dead reader slots");
    Ok(())
}
