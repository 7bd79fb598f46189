//! `backlink` CLI, a terminal front end for the Backlink admin console.
//!
//! Registers backend servers after verifying them with a login and a ping,
//! keeps track of the active one, and shows what a stored bearer token
//! says about its owner.

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod config;

use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use backlink_core::token::format_timestamp;
use backlink_core::workflow::CONNECTION_ERROR_TITLE;
use backlink_core::{
    ApiClient, BackendServer, ClaimRow, ConnectOutcome, ConnectionPhase, ConnectionStore,
    ConnectionWorkflow, ExpiryStatus, FormMode, ServerForm, ServerId, Theme,
    inspect_authorization,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::config::CliConfig;

// ── ANSI color helpers ───────────────────────────────────────────────

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const WHITE: &str = "\x1b[37m";
const BG_RED: &str = "\x1b[41m";
const BG_GREEN: &str = "\x1b[42m";
const BG_YELLOW: &str = "\x1b[43m";

// ── CLI structure ────────────────────────────────────────────────────

/// Backlink: connect the admin console to its backends.
#[derive(Parser)]
#[command(
    name = "backlink",
    version,
    about = "Backlink CLI: register admin backends, verify them, inspect their tokens",
    long_about = None,
    after_help = format!(
        "{DIM}Environment variables:{RESET}\n  \
         BACKLINK_DATA_DIR       Data directory (default: $HOME/.backlink)\n  \
         BACKLINK_STORAGE        file, memory, or redb (default: file)\n  \
         BACKLINK_HTTP_TIMEOUT   Request timeout in seconds (default: 10)\n  \
         BACKLINK_LOG_LEVEL      Log filter when RUST_LOG is unset (default: warn)\n\n\
         {DIM}Examples:{RESET}\n  \
         backlink server add --name prod --host https://api.example.com/ \\\n      \
           --username admin --password '...' --ping-path /ping --active\n  \
         backlink server list\n  \
         backlink server auth 1\n  \
         backlink settings theme light"
    ),
)]
struct Cli {
    #[command(flatten)]
    config: CliConfig,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registered backend servers.
    Server {
        #[command(subcommand)]
        action: ServerCommands,
    },
    /// Console settings.
    Settings {
        #[command(subcommand)]
        action: SettingsCommands,
    },
}

#[derive(Subcommand)]
enum ServerCommands {
    /// Log in, ping, and save a new backend server.
    Add {
        /// Display name.
        #[arg(long)]
        name: String,
        /// Base URL, e.g. `https://api.example.com/`.
        #[arg(long)]
        host: String,
        /// Username or email used for the login call.
        #[arg(long)]
        username: String,
        /// Password for the login call. Never stored.
        #[arg(long, env = "BACKLINK_PASSWORD", hide_env_values = true)]
        password: String,
        /// Health-check route, starting with `/`.
        #[arg(long)]
        ping_path: String,
        /// Free-form description.
        #[arg(long)]
        description: Option<String>,
        /// Make this the active backend.
        #[arg(long, default_value = "false")]
        active: bool,
    },
    /// Change fields of a saved backend server. No requests are made.
    Edit {
        /// Id, unique id prefix, or 1-based position.
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        ping_path: Option<String>,
        /// Pass an empty string to clear it.
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        active: Option<bool>,
    },
    /// List saved backend servers.
    List,
    /// Remove a backend server.
    Remove {
        /// Id, unique id prefix, or 1-based position.
        id: String,
    },
    /// Make a backend server the active one.
    Activate {
        /// Id, unique id prefix, or 1-based position.
        id: String,
    },
    /// Remove every backend server.
    Reset,
    /// Show the stored token's claims and the user it belongs to.
    Auth {
        /// Id, unique id prefix, or 1-based position.
        id: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Show or set the color theme.
    Theme {
        /// `light` or `dark`.
        theme: Option<Theme>,
    },
}

// ── Pretty output helpers ────────────────────────────────────────────

fn header(icon: &str, title: &str) {
    println!("{BOLD}{CYAN}{icon} {title}{RESET}");
    println!("{DIM}─────────────────────────────────────────{RESET}");
}

fn kv_line(key: &str, value: &str) {
    println!("  {DIM}{key:<20}{RESET} {WHITE}{value}{RESET}");
}

fn success(msg: &str) {
    println!("{GREEN}{BOLD}✓{RESET} {msg}");
}

fn warning(msg: &str) {
    println!("{YELLOW}{BOLD}⚠{RESET} {YELLOW}{msg}{RESET}");
}

fn alert(title: &str, message: &str, status: u16) {
    eprintln!();
    eprintln!("  {RED}{BOLD}✗ {title}{RESET}");
    eprintln!("    {message}");
    if status == 0 {
        eprintln!("    {DIM}no response from backend{RESET}");
    } else {
        eprintln!("    {DIM}HTTP status {status}{RESET}");
    }
}

fn short_id(id: ServerId) -> String {
    id.to_string().chars().take(8).collect()
}

fn print_phase(phase: &ConnectionPhase) {
    match phase {
        ConnectionPhase::Authorizing => println!("  {DIM}◌ Authorizing…{RESET}"),
        ConnectionPhase::Pinging => {
            println!("  {GREEN}✓{RESET} Authorized");
            println!("  {DIM}◌ Pinging…{RESET}");
        }
        ConnectionPhase::PingSucceeded => println!("  {GREEN}✓{RESET} Ping succeeded"),
        ConnectionPhase::Idle
        | ConnectionPhase::AuthorizeFailed { .. }
        | ConnectionPhase::PingFailed { .. }
        | ConnectionPhase::SaveFailed { .. } => {}
    }
}

fn print_server(server: &BackendServer) {
    kv_line("Id", &server.id.to_string());
    kv_line("Name", &server.name);
    if let Some(description) = &server.description {
        kv_line("Description", description);
    }
    kv_line("Host", &server.host);
    kv_line("Username", &server.username_or_email);
    kv_line("Ping Path", &server.ping_path);
    let active = if server.in_use {
        format!("{GREEN}yes{RESET}")
    } else {
        "no".to_owned()
    };
    kv_line("Active", &active);
}

fn expiry_badge(row: &ClaimRow) -> String {
    match row.expiry {
        Some(ExpiryStatus::Expired) => format!("{BG_RED}{WHITE}{BOLD} {} {RESET}", row.value),
        Some(ExpiryStatus::ExpiringSoon) => {
            format!("{BG_YELLOW}{WHITE}{BOLD} {} {RESET}", row.value)
        }
        Some(ExpiryStatus::ValidUntil { .. }) => {
            format!("{BG_GREEN}{WHITE}{BOLD} {} {RESET}", row.value)
        }
        None => row.value.clone(),
    }
}

// ── Entry point ──────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.config);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("  {RED}{BOLD}✗ Error:{RESET} {e:#}");
            eprintln!();
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &CliConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(cli: Cli) -> Result<()> {
    let storage = cli.config.open_storage()?;
    let store = ConnectionStore::load(storage)
        .await
        .context("failed to load saved backend servers")?;

    match cli.command {
        Commands::Server { action } => cmd_server(&cli.config, &store, action).await,
        Commands::Settings { action } => cmd_settings(&store, action).await,
    }
}

fn api_client(config: &CliConfig) -> Result<ApiClient> {
    ApiClient::new(config.http_timeout()).context("failed to build HTTP client")
}

/// Accept a full id, a unique id prefix, or a 1-based position.
async fn resolve_id(store: &ConnectionStore, input: &str) -> Result<ServerId> {
    let input = input.trim();
    if input.is_empty() {
        bail!("backend server id is empty");
    }
    let servers = store.servers().await;

    if let Some(server) = input
        .parse::<usize>()
        .ok()
        .and_then(|position| position.checked_sub(1))
        .and_then(|index| servers.get(index))
    {
        return Ok(server.id);
    }

    if let Ok(id) = input.parse::<ServerId>() {
        if servers.iter().any(|s| s.id == id) {
            return Ok(id);
        }
        bail!("no backend server with id {id}");
    }

    let needle = input.to_ascii_lowercase();
    let matches: Vec<&BackendServer> = servers
        .iter()
        .filter(|s| s.id.to_string().starts_with(&needle))
        .collect();
    match matches.as_slice() {
        [one] => Ok(one.id),
        [] => bail!("no backend server matches '{input}'"),
        _ => bail!(
            "'{input}' matches {} backend servers; use more of the id",
            matches.len()
        ),
    }
}

// ── Commands ─────────────────────────────────────────────────────────

async fn cmd_server(
    config: &CliConfig,
    store: &ConnectionStore,
    action: ServerCommands,
) -> Result<()> {
    match action {
        ServerCommands::Add {
            name,
            host,
            username,
            password,
            ping_path,
            description,
            active,
        } => {
            let form = ServerForm {
                name,
                description,
                host,
                username_or_email: username,
                password,
                ping_path,
                in_use: active,
            };
            cmd_add(config, store, form).await
        }
        ServerCommands::Edit {
            id,
            name,
            host,
            username,
            ping_path,
            description,
            active,
        } => {
            let id = resolve_id(store, &id).await?;
            let server = store
                .server(id)
                .await
                .with_context(|| format!("backend server {id} not found"))?;
            let mut form = ServerForm::from(&server);
            if let Some(name) = name {
                form.name = name;
            }
            if let Some(host) = host {
                form.host = host;
            }
            if let Some(username) = username {
                form.username_or_email = username;
            }
            if let Some(ping_path) = ping_path {
                form.ping_path = ping_path;
            }
            if description.is_some() {
                form.description = description;
            }
            if let Some(active) = active {
                form.in_use = active;
            }
            cmd_edit(config, store, id, form).await
        }
        ServerCommands::List => {
            cmd_list(store).await;
            Ok(())
        }
        ServerCommands::Remove { id } => {
            let id = resolve_id(store, &id).await?;
            let removed = store.remove_server(id).await?;
            success(&format!("Removed {}", removed.name));
            Ok(())
        }
        ServerCommands::Activate { id } => {
            let id = resolve_id(store, &id).await?;
            store.set_active(id).await?;
            let name = store.server(id).await.map(|s| s.name).unwrap_or_default();
            success(&format!("{name} is now the active backend"));
            Ok(())
        }
        ServerCommands::Reset => {
            let count = store.len().await;
            store.reset_servers().await?;
            success(&format!("Removed {count} backend server(s)"));
            Ok(())
        }
        ServerCommands::Auth { id } => {
            let id = resolve_id(store, &id).await?;
            cmd_auth(config, store, id).await
        }
    }
}

async fn cmd_add(config: &CliConfig, store: &ConnectionStore, form: ServerForm) -> Result<()> {
    let workflow = ConnectionWorkflow::new(api_client(config)?);
    let mut progress = workflow.subscribe();
    let name = form.name.clone();

    header("🔗", &format!("Connecting {name}"));

    let submission = workflow.submit(store, form, FormMode::Create);
    tokio::pin!(submission);
    let outcome = loop {
        tokio::select! {
            biased;
            Ok(()) = progress.changed() => {
                let phase = progress.borrow_and_update().phase.clone();
                print_phase(&phase);
            }
            outcome = &mut submission => break outcome,
        }
    };
    // The last phase can land in the same poll that finishes the submission.
    if progress.has_changed().unwrap_or(false) {
        let phase = progress.borrow_and_update().phase.clone();
        print_phase(&phase);
    }
    let outcome = outcome?;

    match outcome {
        ConnectOutcome::Committed { id, .. } => {
            println!();
            success("Saved successfully");
            if let Some(server) = store.server(id).await {
                print_server(&server);
            }
            println!();
            Ok(())
        }
        ConnectOutcome::AuthorizeFailed { message, status }
        | ConnectOutcome::PingFailed {
            message, status, ..
        } => {
            alert(CONNECTION_ERROR_TITLE, &message, status);
            bail!("{CONNECTION_ERROR_TITLE}: {name} was not saved")
        }
        ConnectOutcome::Updated { .. } | ConnectOutcome::Superseded => {
            bail!("submission for {name} did not complete")
        }
    }
}

async fn cmd_edit(
    config: &CliConfig,
    store: &ConnectionStore,
    id: ServerId,
    form: ServerForm,
) -> Result<()> {
    let workflow = ConnectionWorkflow::new(api_client(config)?);
    match workflow.submit(store, form, FormMode::Edit(id)).await? {
        ConnectOutcome::Updated { id } => {
            success("Saved successfully");
            if let Some(server) = store.server(id).await {
                print_server(&server);
            }
            Ok(())
        }
        other => bail!("unexpected edit outcome: {other:?}"),
    }
}

async fn cmd_list(store: &ConnectionStore) {
    let servers = store.servers().await;
    header("🔗", "Backend Servers");

    if servers.is_empty() {
        println!("  {DIM}(no backend servers){RESET}");
        println!();
        return;
    }

    for (i, server) in servers.iter().enumerate() {
        let marker = if server.in_use {
            format!("{GREEN}●{RESET}")
        } else {
            format!("{DIM}○{RESET}")
        };
        let status = if server.is_connected() {
            format!("{GREEN}connected{RESET}")
        } else {
            format!("{YELLOW}no token{RESET}")
        };
        println!(
            "  {:>2}. {marker} {BOLD}{:<20}{RESET} {:<28} {DIM}{}{RESET}  {status}",
            i + 1,
            server.name,
            server.display_host(),
            short_id(server.id),
        );
        if let Some(description) = &server.description {
            println!("         {DIM}{description}{RESET}");
        }
    }
    println!();
}

async fn cmd_auth(config: &CliConfig, store: &ConnectionStore, id: ServerId) -> Result<()> {
    let api = api_client(config)?;
    let details = inspect_authorization(store, &api, id).await?;

    header("🔑", &format!("Authorization: {}", details.server.name));
    kv_line("Host", &details.server.display_host());
    kv_line(
        "Saved",
        &format_timestamp(details.server.created_at.timestamp()),
    );
    println!();

    if details.claims.is_none() {
        warning("Stored token could not be decoded");
    } else {
        for row in &details.rows {
            kv_line(&row.key, &expiry_badge(row));
        }
    }
    println!();

    header("👤", "User");
    match (&details.user, &details.user_error) {
        (Some(user), _) => {
            kv_line("Username", &user.username);
            kv_line("Email", &user.email);
            kv_line("Status", user.status.label());
            kv_line("Confirmation", &user.confirmation.to_string());
        }
        (None, Some(e)) => warning(&format!("Could not fetch user profile: {e}")),
        (None, None) => println!("  {DIM}(not connected){RESET}"),
    }
    println!();
    Ok(())
}

async fn cmd_settings(store: &ConnectionStore, action: SettingsCommands) -> Result<()> {
    match action {
        SettingsCommands::Theme { theme: Some(theme) } => {
            store.set_theme(theme).await?;
            success(&format!("Theme set to {theme}"));
        }
        SettingsCommands::Theme { theme: None } => {
            header("🎨", "Settings");
            kv_line("Theme", &store.theme().await.to_string());
            println!();
        }
    }
    Ok(())
}
