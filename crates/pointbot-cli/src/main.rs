//! CLI interface for pointbot - Twitch channel-point reactions.

use std::env;
use std::fs::OpenOptions;
use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use chrono::Utc;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use env_logger::fmt::WriteStyle;
use log::{LevelFilter, debug};
use pointbot_core::eventsub::{EventSession, SessionEnd, SessionSettings, WsConnector, reaction_for};
use pointbot_core::paths::write_default_config;
use pointbot_core::platform::{Authenticator, Credential, HelixClient, OAuthSettings, SystemBrowser, TokenStore};
use pointbot_core::{AppConfig, AppPaths, generate_example_config, generate_schema, write_generated_files};
use tokio_util::sync::CancellationToken;

const APP_NAME: &str = "pointbot";
const REPO_URL: &str = env!("CARGO_PKG_REPOSITORY");

fn main() -> anyhow::Result<()> {
    try_main()
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    let rt = tokio::runtime::Runtime::new()?;

    match cli.command.unwrap_or_else(|| Command::Run(RunCommand::default())) {
        Command::Run(cmd) => rt.block_on(handle_run(&ctx, cmd)),
        Command::Auth { subcommand } => rt.block_on(handle_auth(&ctx, subcommand)),
        Command::Lookup { login } => rt.block_on(handle_lookup(&ctx, &login)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => {
            handle_completions(shell);
            Ok(())
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "pointbot",
    author,
    version,
    about = "React to Twitch channel-point redemptions",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
}

/// Common CLI options shared across all subcommands.
#[derive(Debug, Clone, Args)]
pub struct CommonOpts {
    /// Override the config file path.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,
    /// Reduce output to only errors.
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    pub quiet: bool,
    /// Increase logging verbosity (stackable).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,
    /// Enable trace logging.
    #[arg(long, global = true)]
    pub trace: bool,
    /// Output machine-readable JSON.
    #[arg(long, global = true)]
    pub json: bool,
    /// Disable ANSI colors in output.
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    pub no_color: bool,
    /// Control color output.
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    pub color: ColorOption,
    /// Do not change anything on disk.
    #[arg(long = "dry-run", global = true)]
    pub dry_run: bool,
    /// Assume "yes" for interactive prompts.
    #[arg(short = 'y', long = "yes", alias = "force", global = true)]
    pub assume_yes: bool,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorOption {
    /// Detect terminal capabilities automatically.
    Auto,
    /// Always emit ANSI color codes.
    Always,
    /// Never emit ANSI color codes.
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to EventSub and react to redemptions (default).
    Run(RunCommand),
    /// Authentication (login, status, refresh, logout).
    Auth {
        #[command(subcommand)]
        subcommand: AuthSubcommand,
    },
    /// Resolve a Twitch login name to its user ID.
    Lookup {
        /// Login name to resolve.
        login: String,
    },
    /// Create config directories and default files.
    Init(InitCommand),
    /// Inspect and manage configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Default, Args)]
struct RunCommand {
    /// Channel to watch instead of `twitch.broadcaster_login`.
    #[arg(long, value_name = "LOGIN")]
    broadcaster: Option<String>,
    /// Launch the system browser if authorization is needed.
    #[arg(long)]
    open: bool,
}

#[derive(Debug, Clone, Copy, Subcommand)]
enum AuthSubcommand {
    /// Authorize in the browser and cache a fresh token.
    Login {
        /// Launch the system browser instead of only printing the URL.
        #[arg(long)]
        open: bool,
    },
    /// Show the cached token.
    Status,
    /// Exchange the cached refresh token for a new access token.
    Refresh,
    /// Delete the cached token.
    Logout,
}

#[derive(Debug, Clone, Copy, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists.
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration.
    Show,
    /// Print the resolved config file path.
    Path,
    /// Print all resolved paths.
    Paths,
    /// Print the JSON schema.
    Schema,
    /// Print an example configuration, or write it with the schema to a directory.
    Example {
        /// Write `config.toml` and `config.schema.json` here instead of printing.
        #[arg(long, value_name = "DIR")]
        out: Option<PathBuf>,
    },
    /// Regenerate the default configuration file.
    Reset,
}

// ─── Runtime ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.as_deref())?;
        let config = AppConfig::load(&paths, common.dry_run)?;
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
        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
        builder.filter_level(self.effective_log_level());

        let force_color = matches!(self.common.color, ColorOption::Always)
            || env::var_os("FORCE_COLOR").is_some();
        let mut disable_color = self.common.no_color
            || matches!(self.common.color, ColorOption::Never)
            || env::var_os("NO_COLOR").is_some()
            || (!force_color && !io::stderr().is_terminal());

        if let Some(ref file) = self.config.logging.file {
            let target = OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .with_context(|| format!("opening log file {file}"))?;
            builder.target(env_logger::Target::Pipe(Box::new(target)));
            disable_color = true;
        }

        if disable_color {
            builder.write_style(WriteStyle::Never);
        } else if force_color {
            builder.write_style(WriteStyle::Always);
        } else {
            builder.write_style(WriteStyle::Auto);
        }

        builder.try_init().or_else(|err| {
            if self.common.verbose > 0 {
                eprintln!("logger already initialized: {err}");
            }
            Ok(())
        })
    }

    const fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self.config.logging.level.as_filter(),
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            self.paths.log_dry_run();
            return Ok(());
        }
        self.paths.ensure_directories()
    }

    fn authenticator(&self, config: &AppConfig, open: bool) -> Result<Authenticator> {
        if config.twitch.client_id.is_empty() || config.twitch.client_secret.is_empty() {
            return Err(anyhow!(
                "twitch.client_id and twitch.client_secret must be set (config file, POINTBOT__TWITCH__CLIENT_ID or TWITCH_CLIENT_ID)"
            ));
        }
        let settings = OAuthSettings::from_config(config)?;
        let store = TokenStore::new(self.paths.token_file.clone());
        let browser = SystemBrowser {
            launch: open || config.auth.open_browser,
        };
        Ok(Authenticator::new(settings, store)?.with_browser(browser))
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("interrupt received, shutting down");
                trigger.cancel();
            }
            Err(e) => log::warn!("could not listen for Ctrl-C: {e}"),
        }
    });
    token
}

// ─── Handlers ────────────────────────────────────────────────────────

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let mut config = ctx.config.clone();
    if let Some(login) = cmd.broadcaster {
        config.twitch.broadcaster_login = login;
    }
    config.validate()?;

    let shutdown = shutdown_on_ctrl_c();
    let auth = ctx.authenticator(&config, cmd.open)?;
    let credential = tokio::select! {
        () = shutdown.cancelled() => return Ok(()),
        credential = auth.acquire_token() => credential?,
    };

    let helix = Arc::new(HelixClient::new(
        &config.twitch.api_base,
        &config.twitch.client_id,
        &credential,
    )?);
    let user_id = helix
        .resolve_user_id(&config.twitch.broadcaster_login)
        .await
        .with_context(|| format!("resolving broadcaster '{}'", config.twitch.broadcaster_login))?;
    log::info!(
        "watching redemptions for {} (id {user_id})",
        config.twitch.broadcaster_login
    );

    let mut session = EventSession::new(
        SessionSettings::from_config(&config),
        user_id,
        Box::new(WsConnector),
        helix.clone(),
        reaction_for(&config.reactions),
    );
    let outcome = session.run(&shutdown).await;
    helix.close();

    match outcome? {
        SessionEnd::Interrupted => debug!("stopped by interrupt"),
        SessionEnd::IdleTimeout => {
            if !ctx.common.quiet {
                eprintln!("No events from Twitch within the keep-alive window, exiting.");
            }
        }
    }
    Ok(())
}

async fn handle_auth(ctx: &RuntimeContext, cmd: AuthSubcommand) -> Result<()> {
    match cmd {
        AuthSubcommand::Login { open } => {
            let auth = ctx.authenticator(&ctx.config, open)?;
            let credential = auth.login().await?;
            println!("Authenticated. Token cached at {}", auth.store().path().display());
            print_credential(ctx, &credential)
        }
        AuthSubcommand::Status => {
            let store = TokenStore::new(ctx.paths.token_file.clone());
            match store.load() {
                Ok(credential) => print_credential(ctx, &credential),
                Err(pointbot_core::CoreError::SecretNotFound(_)) => {
                    println!("Not authenticated. Run 'pointbot auth login' to authenticate.");
                    Ok(())
                }
                Err(e) => Err(anyhow!("Error checking auth status: {e}")),
            }
        }
        AuthSubcommand::Refresh => {
            let auth = ctx.authenticator(&ctx.config, false)?;
            let cached = auth
                .status()?
                .ok_or_else(|| anyhow!("no cached token. Run 'pointbot auth login' first."))?;
            let credential = auth.refresh(&cached).await?;
            println!("Token refreshed.");
            print_credential(ctx, &credential)
        }
        AuthSubcommand::Logout => {
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would delete {}",
                    ctx.paths.token_file.display()
                );
                return Ok(());
            }
            TokenStore::new(ctx.paths.token_file.clone()).clear()?;
            println!("Logged out.");
            Ok(())
        }
    }
}

fn print_credential(ctx: &RuntimeContext, credential: &Credential) -> Result<()> {
    let now = Utc::now();
    let remaining = credential.remaining(now);
    if ctx.common.json {
        let status = serde_json::json!({
            "valid": credential.is_usable_at(now),
            "expiry": credential.expiry,
            "remaining_secs": remaining.num_seconds(),
            "scopes": credential.scopes,
            "refreshable": credential.refresh_token.is_some(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&status).context("serializing status to JSON")?
        );
        return Ok(());
    }

    if credential.is_usable_at(now) {
        let mins = remaining.num_minutes();
        let secs = remaining.num_seconds() % 60;
        println!("Token expires:    {} ({mins}m {secs}s remaining)", credential.expiry);
    } else {
        println!("Token expired:    {}", credential.expiry);
    }
    println!("Scopes:           {}", credential.scopes.join(" "));
    println!(
        "Refreshable:      {}",
        if credential.refresh_token.is_some() { "yes" } else { "no" }
    );
    Ok(())
}

async fn handle_lookup(ctx: &RuntimeContext, login: &str) -> Result<()> {
    let auth = ctx.authenticator(&ctx.config, false)?;
    let credential = auth.acquire_token().await?;
    let helix = HelixClient::new(&ctx.config.twitch.api_base, &ctx.config.twitch.client_id, &credential)?;
    let lookup = helix.resolve_user_id(login).await;
    helix.close();
    let user_id = lookup?;

    if ctx.common.json {
        println!("{}", serde_json::json!({ "login": login, "id": user_id }));
    } else {
        println!("{user_id}");
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !(cmd.force || ctx.common.assume_yes) {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }
    if ctx.common.dry_run {
        log::info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }
    write_default_config(&ctx.paths.config_file)
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
        ConfigCommand::Paths => {
            if ctx.common.json {
                let paths = serde_json::json!({
                    "config": ctx.paths.config_file,
                    "data": ctx.paths.data_dir,
                    "state": ctx.paths.state_dir,
                    "token": ctx.paths.token_file,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&paths).context("serializing paths to JSON")?
                );
            } else {
                println!("config: {}", ctx.paths.config_file.display());
                println!("data:   {}", ctx.paths.data_dir.display());
                println!("state:  {}", ctx.paths.state_dir.display());
                println!("token:  {}", ctx.paths.token_file.display());
            }
            Ok(())
        }
        ConfigCommand::Schema => {
            println!("{}", generate_schema(APP_NAME, REPO_URL)?);
            Ok(())
        }
        ConfigCommand::Example { out: Some(dir) } => {
            if ctx.common.dry_run {
                log::info!("dry-run: would write example files to {}", dir.display());
                return Ok(());
            }
            write_generated_files(&dir, APP_NAME, REPO_URL)?;
            println!("Wrote example config and schema to {}", dir.display());
            Ok(())
        }
        ConfigCommand::Example { out: None } => {
            print!("{}", generate_example_config(APP_NAME)?);
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                log::info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
}
