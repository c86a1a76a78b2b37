use std::io::Write;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use workbench_proxy::{build_router, ProxyConfig, ProxyError};
use workbench_sync::types::{
    Message, ModelRef, SendMessageRequest, Session, SessionStatus, SessionStatusMap, Todo,
    Workspace,
};
use workbench_sync::{QueryState, SyncClient, SyncConfig, SyncError, TransportMode};

use crate::workspaces::{resolve_workspaces, select_workspace};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4098;

#[derive(Parser, Debug)]
#[command(name = "workbench", bin_name = "workbench", version)]
#[command(about = "Connect to OpenCode workspace servers and keep their state in sync")]
#[command(arg_required_else_help = true)]
pub struct WorkbenchCli {
    #[command(subcommand)]
    pub command: Command,

    /// Bearer token attached to every workspace request.
    #[arg(long, short = 't', global = true, env = "WORKBENCH_TOKEN")]
    pub token: Option<String>,

    /// Workspace definition; repeatable. Replaces the workspaces file.
    #[arg(long = "workspace", short = 'w', global = true, value_name = "ID=URL")]
    pub workspaces: Vec<String>,

    #[arg(long, global = true, env = "WORKBENCH_WORKSPACES_FILE")]
    pub workspaces_file: Option<PathBuf>,

    /// Reach workspaces through a running `workbench proxy` at this URL.
    #[arg(long, global = true, env = "WORKBENCH_PROXY_URL")]
    pub via_proxy: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the /api/v2 reverse proxy.
    Proxy(ProxyArgs),
    /// Follow a workspace's sessions and connection status until interrupted.
    Watch(WatchArgs),
    /// List a workspace's sessions.
    Sessions(SessionsArgs),
    /// Send one message to a session and print the created message id.
    Send(SendArgs),
}

#[derive(Args, Debug)]
pub struct ProxyArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Workspace id; optional when only one workspace is configured.
    #[arg(long = "id", short = 'i')]
    workspace_id: Option<String>,

    #[arg(long, short = 'd')]
    directory: Option<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Also follow this session's messages and todos.
    #[arg(long, short = 's')]
    session: Option<String>,
}

#[derive(Args, Debug)]
pub struct SessionsArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    target: TargetArgs,

    session: String,

    text: String,

    /// `provider/model`.
    #[arg(long, short = 'm')]
    model: Option<String>,

    #[arg(long, short = 'a')]
    agent: Option<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid workspace {0:?}, expected id=http(s)://host")]
    InvalidWorkspace(String),
    #[error("unknown workspace: {0}")]
    UnknownWorkspace(String),
    #[error("no workspaces configured; pass --workspace id=url")]
    NoWorkspaces,
    #[error("several workspaces configured; pick one with --id")]
    AmbiguousWorkspace,
    #[error("invalid model {0:?}, expected provider/model")]
    InvalidModel(String),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_workbench() -> Result<(), CliError> {
    let cli = WorkbenchCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(cli: &WorkbenchCli) -> Result<(), CliError> {
    match &cli.command {
        Command::Proxy(args) => run_proxy(args),
        Command::Watch(args) => run_watch(cli, args),
        Command::Sessions(args) => run_sessions(cli, args),
        Command::Send(args) => run_send(cli, args),
    }
}

pub fn sync_config(cli: &WorkbenchCli) -> SyncConfig {
    let mode = match &cli.via_proxy {
        Some(url) => TransportMode::Proxied {
            proxy_base_url: url.clone(),
        },
        None => TransportMode::Direct,
    };
    SyncConfig {
        mode,
        auth_token: cli.token.clone(),
        ..SyncConfig::default()
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn selected_workspace(cli: &WorkbenchCli, target: &TargetArgs) -> Result<Workspace, CliError> {
    let workspaces = resolve_workspaces(&cli.workspaces, cli.workspaces_file.as_deref())?;
    select_workspace(&workspaces, target.workspace_id.as_deref())
}

fn run_proxy(args: &ProxyArgs) -> Result<(), CliError> {
    let router = build_router(&ProxyConfig::default())?.layer(build_cors_layer(args)?);
    let addr = format!("{}:{}", args.host, args.port);
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(addr = %addr, "proxy listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_cors_layer(args: &ProxyArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }
    Ok(cors)
}

fn run_watch(cli: &WorkbenchCli, args: &WatchArgs) -> Result<(), CliError> {
    let workspace = selected_workspace(cli, &args.target)?;
    let client = SyncClient::new(sync_config(cli));
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let id = workspace.id.as_str();
        let sessions = client.sessions(&workspace, args.target.directory.as_deref())?;
        let statuses = client.session_status(&workspace)?;
        let mut subscriptions = vec![
            sessions.subscribe(log_snapshot(id, "sessions", Vec::<Session>::len)),
            statuses.subscribe(log_snapshot(id, "session-status", busy_count)),
        ];

        let mut followed = None;
        if let Some(session_id) = &args.session {
            let messages = client.session_messages(&workspace, session_id)?;
            let todos = client.session_todos(&workspace, session_id)?;
            subscriptions.push(messages.subscribe(log_snapshot(id, "messages", Vec::<Message>::len)));
            subscriptions.push(todos.subscribe(log_snapshot(id, "todos", active_count)));
            followed = Some((messages, todos));
        }

        info!(workspace_id = %id, "watching, ctrl-c to stop");
        let _ = tokio::signal::ctrl_c().await;

        drop(subscriptions);
        drop(followed);
        drop((sessions, statuses));
        client.dispose();
        Ok::<_, CliError>(())
    })
}

fn busy_count(statuses: &SessionStatusMap) -> usize {
    statuses
        .values()
        .filter(|info| info.status == SessionStatus::Busy)
        .count()
}

#[allow(clippy::ptr_arg)]
fn active_count(todos: &Vec<Todo>) -> usize {
    todos.iter().filter(|todo| todo.is_active()).count()
}

fn log_snapshot<T>(
    workspace_id: &str,
    query: &'static str,
    count: fn(&T) -> usize,
) -> impl Fn(QueryState<T>) + Send + Sync + 'static
where
    T: 'static,
{
    let workspace_id = workspace_id.to_string();
    move |state: QueryState<T>| {
        info!(
            workspace_id = %workspace_id,
            query,
            items = state.data.as_ref().map(count),
            loading = state.is_loading(),
            fetching = state.is_fetching,
            stale = state.is_stale,
            connection = state.connection.as_str(),
            error = state.error.as_ref().map(ToString::to_string),
            "snapshot"
        );
    }
}

fn run_sessions(cli: &WorkbenchCli, args: &SessionsArgs) -> Result<(), CliError> {
    let workspace = selected_workspace(cli, &args.target)?;
    let config = sync_config(cli);
    let wait = config.connect_timeout + config.request_timeout;
    let client = SyncClient::new(config);
    let runtime = build_runtime()?;

    let sessions = runtime.block_on(async {
        let result = client
            .fetch_sessions(&workspace, args.target.directory.as_deref(), wait)
            .await;
        client.dispose();
        result
    })?;

    if args.json {
        write_stdout_line(&serde_json::to_string_pretty(&sessions)?)?;
        return Ok(());
    }
    for session in &sessions {
        write_stdout_line(&session_line(session))?;
    }
    Ok(())
}

fn session_line(session: &Session) -> String {
    let status = session.status.map(|status| status.as_str()).unwrap_or("-");
    let directory = session.directory.as_deref().unwrap_or("-");
    let kind = if session.is_child() { "child" } else { "root" };
    format!("{}\t{}\t{}\t{}\t{}", session.id, status, kind, directory, session.title)
}

fn run_send(cli: &WorkbenchCli, args: &SendArgs) -> Result<(), CliError> {
    let workspace = selected_workspace(cli, &args.target)?;
    let model = args
        .model
        .as_deref()
        .map(|value| ModelRef::parse(value).ok_or_else(|| CliError::InvalidModel(value.to_string())))
        .transpose()?;
    let request = SendMessageRequest {
        text: args.text.clone(),
        model,
        agent: args.agent.clone(),
    };
    let client = SyncClient::new(sync_config(cli));
    let runtime = build_runtime()?;

    let message = runtime.block_on(async {
        let result = client.send_message(&workspace, &args.session, request).await;
        client.dispose();
        result
    })?;
    info!(
        workspace_id = %workspace.id,
        session_id = %args.session,
        message_id = %message.info.id,
        "message sent"
    );
    write_stdout_line(&message.info.id)?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
