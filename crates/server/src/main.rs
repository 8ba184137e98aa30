//! MegaTrade chat
//!
//! Group-chat relay for trading operators, plus a terminal client that joins
//! a room through the `megatrade-client` session manager.

mod auth;
mod cmd_join;
mod cmd_status;
mod logging;
mod paths;
mod state;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{middleware, response::IntoResponse, routing::get, Router};
use clap::{Args, Parser, Subcommand};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::RoomRegistry;
use crate::websocket::ws_handler;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "megatrade")]
#[command(about = "MegaTrade operator group chat", version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Custom data directory (defaults to ~/.megatrade)
    #[arg(long, global = true, env = "MEGATRADE_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the chat relay in the foreground
    Start(StartArgs),

    /// Join a room from the terminal
    Join(cmd_join::JoinArgs),

    /// Check whether a relay is running
    Status {
        /// Relay base URL
        #[arg(long, default_value = "http://127.0.0.1:4000")]
        url: String,
    },

    /// Create a random auth token and save it to the data dir
    GenerateToken,
}

#[derive(Args)]
struct StartArgs {
    /// Address to listen on
    #[arg(long, env = "MEGATRADE_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// Require this token on room connections
    #[arg(long, env = "MEGATRADE_AUTH_TOKEN")]
    auth_token: Option<String>,

    /// Keep at most this many messages per room
    #[arg(long)]
    history_limit: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let data_dir = paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command {
        Commands::Start(args) => run_server(args).await,
        Commands::Join(args) => cmd_join::run(args).await,
        Commands::Status { url } => cmd_status::run(&data_dir, &url).await,
        Commands::GenerateToken => cmd_status::generate_token(&data_dir),
    }
}

async fn run_server(args: StartArgs) -> anyhow::Result<()> {
    paths::ensure_dirs().context("Failed to create data directory")?;
    let logging = logging::init_logging(&paths::log_dir(), "server.log")?;

    let auth_token = args.auth_token.filter(|t| !t.trim().is_empty());
    if auth_token.is_none() && !args.bind.ip().is_loopback() {
        warn!(
            component = "server",
            event = "server.auth.disabled",
            bind = %args.bind,
            "Listening on a non-loopback address without an auth token"
        );
    }

    let state = Arc::new(RoomRegistry::new(args.history_limit));
    let app = app(state, auth_token.clone());

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    let addr = listener.local_addr()?;

    info!(
        component = "server",
        event = "server.started",
        run_id = %logging.run_id,
        bind = %addr,
        auth = auth_token.is_some(),
        history_limit = ?args.history_limit,
        version = VERSION,
        "MegaTrade relay listening"
    );

    println!();
    println!("  MegaTrade relay v{}", VERSION);
    println!("  Rooms:  ws://{}/chat/<room>", addr);
    println!("  Health: http://{}/health", addr);
    println!("  Logs:   {}", logging.log_path.display());
    if auth_token.is_some() {
        println!("  Auth:   token required");
    }
    println!();

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "server",
                event = "server.signal.failed",
                error = %e,
            );
            std::future::pending::<()>().await;
        }
        info!(
            component = "server",
            event = "server.shutdown",
            "Received shutdown signal"
        );
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    Ok(())
}

/// Relay router: room sockets, health check and the optional token gate.
pub(crate) fn app(state: Arc<RoomRegistry>, auth_token: Option<String>) -> Router {
    let mut router = Router::new()
        .route("/chat/{room}", get(ws_handler))
        .route("/health", get(health_handler));

    if let Some(token) = auth_token {
        let token: Arc<str> = Arc::from(token);
        router = router.layer(middleware::from_fn_with_state(token, auth::auth_middleware));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}
