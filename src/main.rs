use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, Parser, Subcommand};
use hostmerge::config::{
    ConfigError, EffectiveConfig, SourceSpec, default_repo_config_yaml,
    expand_tilde, load_effective_config,
};
use hostmerge::fetch::{FetchError, build_fetcher};
use hostmerge::ingest::{Driver, DriverSettings, IngestError};
use hostmerge::logging::{LoggingError, init_logging};
use hostmerge::normalize::{NormalizerRegistry, RegistryError};
use hostmerge::store::{Store, StoreError};
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn io(code: &'static str, err: io::Error) -> Self {
        Self::new(code, err.to_string())
    }
}

impl From<StoreError> for CliError {
    fn from(value: StoreError) -> Self {
        Self::new("storage_error", value.to_string())
    }
}

impl From<ConfigError> for CliError {
    fn from(value: ConfigError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<RegistryError> for CliError {
    fn from(value: RegistryError) -> Self {
        Self::new("config_error", value.to_string())
    }
}

impl From<FetchError> for CliError {
    fn from(value: FetchError) -> Self {
        Self::new("fetcher_error", value.to_string())
    }
}

impl From<IngestError> for CliError {
    fn from(value: IngestError) -> Self {
        match value {
            IngestError::Storage(err) => err.into(),
            IngestError::Registry(err) => err.into(),
            other => Self::new("ingest_error", other.to_string()),
        }
    }
}

impl From<LoggingError> for CliError {
    fn from(value: LoggingError) -> Self {
        Self::new("logging_error", value.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(value: serde_json::Error) -> Self {
        Self::new("json_error", value.to_string())
    }
}

#[derive(Parser, Debug)]
#[command(name = "hostmerge")]
#[command(about = "Deduplicates host inventory feeds into canonical host records")]
struct Cli {
    #[arg(long, global = true)]
    global: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init,
    Ingest(IngestArgs),
    Reset,
    Hosts(HostsArgs),
    Show(ShowArgs),
    Checkpoints,
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Wipe canonical records, raw archive and checkpoints first.
    #[arg(long)]
    reset: bool,
    #[arg(long)]
    parallel: bool,
    /// Only ingest the named source; repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
}

#[derive(Args, Debug)]
struct HostsArgs {
    #[arg(long)]
    source: Option<String>,
}

#[derive(Args, Debug)]
struct ShowArgs {
    canonical_id: i64,
}

#[derive(Debug, Clone)]
struct RepoPaths {
    root: PathBuf,
    repo_config: PathBuf,
    user_config: PathBuf,
    cwd: PathBuf,
    home: PathBuf,
    mode: StorageMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageMode {
    RepoLocal,
    Global,
}

struct Context {
    paths: RepoPaths,
    config: EffectiveConfig,
    db_path: PathBuf,
}

impl Context {
    fn open_store(&self) -> Result<Store, CliError> {
        Ok(Store::open(&self.db_path, self.config.database.busy_timeout)?)
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let payload = json!({
                "error": {
                    "code": err.code,
                    "message": err.message,
                }
            });
            eprintln!("{payload}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().map_err(|err| CliError::io("cwd_error", err))?;
    let paths = repo_paths(&cwd, cli.global)?;

    if let Command::Init = cli.command {
        let defaults = EffectiveConfig::default();
        init_logging(&defaults.logging, cli.verbose)?;
        return cmd_init(&paths);
    }

    let ctx = load_context(paths)?;
    init_logging(&ctx.config.logging, cli.verbose)?;
    match cli.command {
        Command::Init => Ok(()),
        Command::Ingest(args) => cmd_ingest(&ctx, args),
        Command::Reset => cmd_reset(&ctx),
        Command::Hosts(args) => cmd_hosts(&ctx, args),
        Command::Show(args) => cmd_show(&ctx, args),
        Command::Checkpoints => cmd_checkpoints(&ctx),
    }
}

fn cmd_init(paths: &RepoPaths) -> Result<(), CliError> {
    fs::create_dir_all(&paths.root).map_err(|err| CliError::io("mkdir_error", err))?;
    let config_path = write_default_config(paths)?;
    let mut config = load_effective_config(Some(&paths.repo_config), Some(&paths.user_config))?;
    config.apply_env(|key| std::env::var(key).ok());
    let db_path = database_path(paths, &config);
    let _ = Store::open(&db_path, config.database.busy_timeout)?;

    print_json(&json!({
        "status": "ok",
        "state_dir": paths.root,
        "config": config_path,
        "database": db_path,
        "mode": match paths.mode {
            StorageMode::RepoLocal => "repo",
            StorageMode::Global => "global",
        },
    }))
}

fn cmd_ingest(ctx: &Context, args: IngestArgs) -> Result<(), CliError> {
    let selected = select_sources(&ctx.config.sources, &args.sources)?;
    if selected.is_empty() {
        return Err(CliError::new(
            "missing_sources",
            "no sources configured; add sources in .hostmerge/config.yml or ~/.hostmerge/config.yml",
        ));
    }
    let registry = NormalizerRegistry::from_sources(&selected)?;
    let fetcher = build_fetcher(&ctx.config.fetcher, &ctx.paths.cwd, &ctx.paths.home)?;

    let reset = if args.reset {
        let store = ctx.open_store()?;
        let summary = store.reset_all_state(&ctx.config.source_names())?;
        info!(
            records_removed = summary.records_removed,
            raw_records_removed = summary.raw_records_removed,
            "state reset before ingest"
        );
        Some(summary)
    } else {
        None
    };

    let mut settings = DriverSettings::from(&ctx.config.pipeline);
    settings.parallel |= args.parallel;
    let descriptors = selected.iter().map(SourceSpec::descriptor).collect();
    let stop = Arc::new(AtomicBool::new(false));
    let driver = Driver::new(
        &ctx.db_path,
        ctx.config.database.busy_timeout,
        fetcher,
        registry,
        descriptors,
        settings,
    )?
    .with_stop_flag(Arc::clone(&stop));

    ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
        .map_err(|err| CliError::new("signal_error", err.to_string()))?;

    let report = driver.run()?;
    let totals = report.totals();
    print_json(&json!({
        "status": if report.is_clean() { "ok" } else { "partial" },
        "reset": reset,
        "totals": totals,
        "report": report,
    }))
}

fn cmd_reset(ctx: &Context) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let summary = store.reset_all_state(&ctx.config.source_names())?;
    print_json(&json!({
        "status": "ok",
        "records_removed": summary.records_removed,
        "raw_records_removed": summary.raw_records_removed,
        "sources_reset": summary.sources_reset,
    }))
}

fn cmd_hosts(ctx: &Context, args: HostsArgs) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let hosts = store.list_records(args.source.as_deref())?;
    print_json(&json!({
        "count": hosts.len(),
        "hosts": hosts,
    }))
}

fn cmd_show(ctx: &Context, args: ShowArgs) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let Some(record) = store.get_record(args.canonical_id)? else {
        return Err(CliError::new(
            "record_not_found",
            format!("canonical record {} not found", args.canonical_id),
        ));
    };

    let mut raw = Vec::new();
    for (source, local_ids) in record.source_ids.iter() {
        for local_id in local_ids {
            raw.push(json!({
                "source": source,
                "local_id": local_id,
                "payload": store.archived_payload(source, local_id)?,
            }));
        }
    }

    print_json(&json!({
        "record": record,
        "raw": raw,
    }))
}

fn cmd_checkpoints(ctx: &Context) -> Result<(), CliError> {
    let store = ctx.open_store()?;
    let checkpoints = store.checkpoints(&ctx.config.source_names())?;
    print_json(&json!({ "checkpoints": checkpoints }))
}

fn select_sources(configured: &[SourceSpec], wanted: &[String]) -> Result<Vec<SourceSpec>, CliError> {
    if wanted.is_empty() {
        return Ok(configured.to_vec());
    }
    let mut seen = HashSet::new();
    wanted
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(|name| {
            configured
                .iter()
                .find(|source| &source.name == name)
                .cloned()
                .ok_or_else(|| {
                    CliError::new("unknown_source", format!("source `{name}` is not configured"))
                })
        })
        .collect()
}

fn load_context(paths: RepoPaths) -> Result<Context, CliError> {
    require_initialized_paths(&paths)?;
    let mut config = load_effective_config(Some(&paths.repo_config), Some(&paths.user_config))?;
    config.apply_env(|key| std::env::var(key).ok());
    config.validate()?;
    let db_path = database_path(&paths, &config);
    if !db_path.exists() {
        return Err(CliError::new(
            "not_initialized",
            format!("database {} does not exist; run `hostmerge init`", db_path.display()),
        ));
    }
    Ok(Context {
        paths,
        config,
        db_path,
    })
}

fn database_path(paths: &RepoPaths, config: &EffectiveConfig) -> PathBuf {
    paths
        .root
        .join(expand_tilde(&config.database.path, &paths.home))
}

fn repo_paths(cwd: &Path, global: bool) -> Result<RepoPaths, CliError> {
    let home = home_dir()?;
    let (root, mode) = if global {
        (home.join(".hostmerge"), StorageMode::Global)
    } else {
        (cwd.join(".hostmerge"), StorageMode::RepoLocal)
    };

    Ok(RepoPaths {
        repo_config: cwd.join(".hostmerge").join("config.yml"),
        user_config: home.join(".hostmerge").join("config.yml"),
        cwd: cwd.to_path_buf(),
        root,
        home,
        mode,
    })
}

fn require_initialized_paths(paths: &RepoPaths) -> Result<(), CliError> {
    if !paths.root.exists() {
        return Err(CliError::new(
            "not_initialized",
            "state directory is not initialized; run `hostmerge init`",
        ));
    }
    Ok(())
}

fn write_default_config(paths: &RepoPaths) -> Result<PathBuf, CliError> {
    let config_path = match paths.mode {
        StorageMode::RepoLocal => &paths.repo_config,
        StorageMode::Global => &paths.user_config,
    };
    if config_path.exists() {
        return Ok(config_path.clone());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|err| CliError::io("mkdir_error", err))?;
    }
    fs::write(config_path, default_repo_config_yaml())
        .map_err(|err| CliError::io("write_error", err))?;
    Ok(config_path.clone())
}

fn home_dir() -> Result<PathBuf, CliError> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| CliError::new("home_error", "HOME environment variable is not set"))
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string(value)?;
    println!("{rendered}");
    Ok(())
}
