use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::{LevelFilter, debug, info, warn};
use tokio_util::sync::CancellationToken;

use prefill::config::{APP_NAME, AppConfig, AppPaths, expand_str_path, load_or_init_config};
use prefill::container::{
    ContainerRuntime, ContainerRuntimeApi, DaemonContainerManager, HostPathResolver,
};
use prefill::db::Database;
use prefill::hub::EventHub;
use prefill::session::{SessionRegistry, recover_orphans};
use prefill::store::{SessionStore, SqliteSessionStore};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext) -> Result<()> {
    handle_serve(&ctx).await
}

#[tokio::main]
async fn async_recover(ctx: RuntimeContext) -> Result<()> {
    handle_recover(&ctx).await
}

#[tokio::main]
async fn async_sessions(ctx: RuntimeContext, cmd: SessionsCommand) -> Result<()> {
    handle_sessions(&ctx, cmd).await
}

#[tokio::main]
async fn async_bans(ctx: RuntimeContext, cmd: BansCommand) -> Result<()> {
    handle_bans(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve => async_serve(ctx),
        Command::Recover => async_recover(ctx),
        Command::Sessions { command } => async_sessions(ctx, command),
        Command::Bans { command } => async_bans(ctx, command),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "prefilld - per-user prefill worker orchestrator.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recover orphans, then run the session sweeper until interrupted
    Serve,
    /// Clean up sessions, workers and mailboxes left by a previous run
    Recover,
    /// Inspect persisted sessions
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    /// Manage banned usernames
    Bans {
        #[command(subcommand)]
        command: BansCommand,
    },
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Subcommand)]
enum SessionsCommand {
    /// List active sessions
    List {
        /// Include terminated, failed and orphaned sessions
        #[arg(long)]
        all: bool,
    },
    /// Show the prefill history of one session
    History {
        /// Session id
        session_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum BansCommand {
    /// List bans in effect
    List,
    /// Ban a username
    Add(BanAddCommand),
    /// Lift a ban
    Remove {
        username: String,
    },
}

#[derive(Debug, Clone, Args)]
struct BanAddCommand {
    username: String,
    /// Why the user is banned
    #[arg(long)]
    reason: Option<String>,
    /// Who issued the ban
    #[arg(long, default_value = "admin")]
    by: String,
    /// Lift the ban automatically after this many days
    #[arg(long, value_name = "DAYS")]
    days: Option<i64>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, common.dry_run)?;
        let paths = paths.apply_overrides(&config)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("prefill={level},prefilld={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // The library logs through `log`.
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(self.config.logging.level.as_str()),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::Info,
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {} and state dir {}",
                self.paths.data_dir.display(),
                self.paths.state_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        fs::create_dir_all(&self.paths.state_dir).with_context(|| {
            format!(
                "creating state directory {}",
                self.paths.state_dir.display()
            )
        })?;
        fs::create_dir_all(self.paths.sessions_dir()).with_context(|| {
            format!(
                "creating sessions directory {}",
                self.paths.sessions_dir().display()
            )
        })?;
        Ok(())
    }

    async fn open_store(&self) -> Result<Arc<dyn SessionStore>> {
        let database = Database::open(&self.paths.database)
            .await
            .context("opening database")?;
        Ok(Arc::new(SqliteSessionStore::new(database.pool().clone())))
    }

    fn container_manager(&self) -> Result<DaemonContainerManager> {
        let container = &self.config.container;
        let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(ContainerRuntime::from_config(
            container.runtime,
            container.binary.as_deref(),
        ));
        let host_override = container
            .host_data_path
            .as_deref()
            .map(expand_str_path)
            .transpose()?;
        let host_paths =
            HostPathResolver::new(Arc::clone(&runtime), self.paths.data_dir.clone(), host_override);
        Ok(DaemonContainerManager::new(
            runtime,
            container.clone(),
            host_paths,
            self.config.sessions.stop_timeout_seconds,
        ))
    }
}

async fn handle_serve(ctx: &RuntimeContext) -> Result<()> {
    let store = ctx.open_store().await?;
    let containers = Arc::new(ctx.container_manager()?);

    if let Err(e) = containers.ensure_image().await {
        warn!(
            "worker image '{}' is not available yet: {}",
            ctx.config.container.image, e
        );
    }

    let registry = SessionRegistry::new(
        containers,
        store,
        Arc::new(EventHub::new()),
        ctx.config.sessions.clone(),
        ctx.config.watcher.clone(),
        ctx.paths.sessions_dir(),
    );

    if let Err(e) = registry.recover_orphans().await {
        warn!("startup recovery failed (continuing anyway): {:?}", e);
    }

    let shutdown = CancellationToken::new();
    let sweeper = registry.spawn_sweeper(shutdown.clone());
    info!(
        "{} running; sessions expire after {} minutes",
        APP_NAME, ctx.config.sessions.timeout_minutes
    );

    wait_for_shutdown_signal().await;

    info!("Shutdown signal received, stopping workers...");
    shutdown.cancel();
    let stopped = registry.terminate_all("shutdown").await;
    if let Err(e) = sweeper.await {
        debug!("sweeper task ended abnormally: {}", e);
    }
    info!("Shutdown complete ({} session(s) stopped)", stopped);
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_recover(ctx: &RuntimeContext) -> Result<()> {
    if ctx.common.dry_run {
        info!("dry-run: would recover orphaned sessions");
        return Ok(());
    }

    let store = ctx.open_store().await?;
    let containers = ctx.container_manager()?;
    let report = recover_orphans(
        store.as_ref(),
        &containers,
        &ctx.paths.sessions_dir(),
        &HashSet::new(),
    )
    .await?;

    if ctx.common.json {
        println!(
            "{}",
            serde_json::json!({
                "orphanedSessions": report.orphaned_sessions,
                "cancelledHistory": report.cancelled_history,
                "containersRemoved": report.containers_removed,
                "containersFailed": report.containers_failed,
                "mailboxesRemoved": report.mailboxes_removed,
            })
        );
    } else {
        println!(
            "orphaned: {}, workers removed: {}, failed: {}, mailboxes removed: {}",
            report.orphaned_sessions.len(),
            report.containers_removed,
            report.containers_failed,
            report.mailboxes_removed
        );
    }
    Ok(())
}

async fn handle_sessions(ctx: &RuntimeContext, command: SessionsCommand) -> Result<()> {
    let store = ctx.open_store().await?;
    match command {
        SessionsCommand::List { all } => {
            let sessions = store.list_sessions(all).await?;
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&sessions).context("serializing sessions")?
                );
                return Ok(());
            }
            if sessions.is_empty() {
                println!("No sessions");
                return Ok(());
            }
            for s in sessions {
                println!(
                    "{}  {:<10}  user={}  login={}  created={}  {}",
                    s.id,
                    s.status.to_string(),
                    s.user_id,
                    s.username.as_deref().unwrap_or("-"),
                    s.created_at,
                    s.termination_reason.as_deref().unwrap_or("")
                );
            }
        }
        SessionsCommand::History { session_id } => {
            let entries = store.list_history(&session_id).await?;
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&entries).context("serializing history")?
                );
                return Ok(());
            }
            if entries.is_empty() {
                println!("No history for session {}", session_id);
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{:>10}  {:<12}  {}/{} bytes  {}{}",
                    entry.app_id,
                    entry.status.to_string(),
                    entry.bytes_downloaded,
                    entry.total_bytes,
                    entry.app_name.as_deref().unwrap_or("-"),
                    entry
                        .error_message
                        .map(|e| format!("  ({e})"))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

async fn handle_bans(ctx: &RuntimeContext, command: BansCommand) -> Result<()> {
    let store = ctx.open_store().await?;
    match command {
        BansCommand::List => {
            let bans = store.list_bans().await?;
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&bans).context("serializing bans")?
                );
                return Ok(());
            }
            if bans.is_empty() {
                println!("No bans");
                return Ok(());
            }
            for ban in bans {
                println!(
                    "{}  by={}  since={}  until={}  {}",
                    ban.username,
                    ban.banned_by.as_deref().unwrap_or("-"),
                    ban.banned_at,
                    ban.expires_at.as_deref().unwrap_or("never"),
                    ban.reason.as_deref().unwrap_or("")
                );
            }
        }
        BansCommand::Add(cmd) => {
            if ctx.common.dry_run {
                info!("dry-run: would ban {}", cmd.username);
                return Ok(());
            }
            let expires_at = cmd
                .days
                .map(|days| chrono::Utc::now() + chrono::Duration::days(days));
            store
                .ban_user(
                    &cmd.username,
                    cmd.reason.as_deref(),
                    Some(cmd.by.as_str()),
                    expires_at,
                )
                .await?;
            println!("Banned {}", cmd.username);
        }
        BansCommand::Remove { username } => {
            if ctx.common.dry_run {
                info!("dry-run: would unban {}", username);
                return Ok(());
            }
            if store.unban_user(&username).await? {
                println!("Unbanned {}", username);
            } else {
                println!("{} was not banned", username);
            }
        }
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}
