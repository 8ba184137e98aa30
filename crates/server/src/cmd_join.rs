//! `megatrade join`: chat in a room from the terminal.
//!
//! Resolves the operator through the account service (or `--display-name`),
//! joins the room, prints the roster on every change and each new message.
//! Lines read from stdin are sent to the room; `/history` asks for a fresh
//! snapshot. EOF or Ctrl-C closes the session.

use anyhow::bail;
use clap::Args;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use megatrade_client::{
    ChatView, ClientConfig, ConnectionStatus, HttpProfileLoader, SessionHandle, SessionOptions,
    SessionUpdate, WsTransport,
};
use megatrade_protocol::{Message, OperatorIdentity, Participant, Role};

use crate::{logging, paths};

#[derive(Debug, Args)]
pub struct JoinArgs {
    /// Operator account id
    #[arg(long, env = "MEGATRADE_OPERATOR_ID")]
    operator_id: String,

    /// Relay WebSocket URL (e.g. ws://127.0.0.1:4000)
    #[arg(long, env = "MEGATRADE_SERVER_URL")]
    server: Option<String>,

    /// Room to join
    #[arg(long)]
    room: Option<String>,

    /// Account service base URL
    #[arg(long, env = "MEGATRADE_ACCOUNT_API")]
    account_api: Option<String>,

    /// Relay auth token (defaults to the saved token file)
    #[arg(long)]
    token: Option<String>,

    /// Skip the account lookup and join under this name
    #[arg(long)]
    display_name: Option<String>,

    /// Join as a regular member instead of an operator
    #[arg(long)]
    member: bool,
}

impl JoinArgs {
    /// Flags override file values.
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(server) = &self.server {
            config.server_url = server.clone();
        }
        if let Some(room) = &self.room {
            config.room = room.clone();
        }
        if let Some(api) = &self.account_api {
            config.account_api = api.clone();
        }
    }
}

pub async fn run(args: JoinArgs) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let _logging = logging::init_logging(&paths::log_dir(), "client.log")?;

    let mut config = ClientConfig::load(&paths::client_config_path())?;
    args.apply(&mut config);
    config.validate()?;

    let mut options = SessionOptions::from_config(&config);
    options.is_operator = !args.member;

    info!(
        component = "join",
        event = "join.starting",
        operator_id = %args.operator_id,
        room_url = %options.room_url,
    );

    let transport = WsTransport::new(args.token.clone().or_else(paths::read_token_file));
    let handle = match &args.display_name {
        Some(name) => SessionHandle::spawn_with_identity(
            OperatorIdentity {
                id: args.operator_id.clone(),
                is_operator: options.is_operator,
                avatar_url: String::new(),
                display_name: name.clone(),
            },
            transport,
            options,
        ),
        None => SessionHandle::spawn(
            args.operator_id.clone(),
            HttpProfileLoader::new(config.account_api.clone()),
            transport,
            options,
        ),
    };

    println!();
    println!("  Joining {} as {}", style(&config.room).bold(), args.operator_id);
    println!("  Type a message and press Enter. /history reloads, Ctrl-D leaves.");
    println!();

    let result = chat_loop(&handle).await;
    handle.close().await;
    result
}

async fn chat_loop(handle: &SessionHandle) -> anyhow::Result<()> {
    let mut updates = handle.subscribe();
    // The actor may already have published updates; catch up from its view.
    if let ConnectionStatus::Closed { error } = handle.status() {
        return closed(error);
    }
    if let Ok(view) = handle.view().await {
        for line in view_lines(&view) {
            println!("{line}");
        }
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(SessionUpdate::Status(ConnectionStatus::Closed { error })) => {
                    return closed(error);
                }
                Ok(update) => render_update(&update),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "join",
                        event = "join.updates.lagged",
                        skipped,
                    );
                    if let Ok(view) = handle.view().await {
                        println!("{}", style(format!("  ({skipped} updates skipped)")).dim());
                        println!("{}", roster_table(&view.roster));
                    }
                }
                Err(RecvError::Closed) => return closed(None),
            },

            line = stdin.next_line() => match line {
                Ok(Some(line)) => submit(handle, &line).await,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!(
                        component = "join",
                        event = "join.stdin.failed",
                        error = %e,
                    );
                    return Ok(());
                }
            },

            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

async fn submit(handle: &SessionHandle, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let result = if line == "/history" {
        handle.request_history().await
    } else {
        handle.send_message(line).await
    };

    if let Err(e) = result {
        eprintln!("{}", style(format!("  ! {e}")).yellow());
    }
}

fn closed(error: Option<String>) -> anyhow::Result<()> {
    match error {
        Some(error) => bail!(error),
        None => Ok(()),
    }
}

fn render_update(update: &SessionUpdate) {
    match update {
        SessionUpdate::IdentityResolved(identity) => {
            println!(
                "  Signed in as {}",
                style(&identity.display_name).bold().cyan()
            );
        }
        SessionUpdate::IdentityFailed(e) => {
            eprintln!("{}", style(format!("  Could not load your profile: {e}")).red());
        }
        SessionUpdate::Status(status) => {
            if let Some(line) = status_line(status) {
                println!("{}", style(line).dim());
            }
        }
        SessionUpdate::RosterReplaced(roster) => println!("{}", roster_table(roster)),
        SessionUpdate::HistoryReplaced(messages) => {
            println!("{}", style(format!("  -- {} earlier messages --", messages.len())).dim());
            for message in messages {
                println!("{}", format_message(message));
            }
        }
        SessionUpdate::MessageAppended(message) => println!("{}", format_message(message)),
        SessionUpdate::RelayError { code, message } => {
            eprintln!("{}", style(format!("  ! {message} ({code})")).yellow());
        }
    }
}

/// Everything already in the session when the terminal starts following it.
fn view_lines(view: &ChatView) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(identity) = &view.identity {
        lines.push(format!("  Signed in as {}", identity.display_name));
    }
    if !view.roster.is_empty() {
        lines.push(roster_table(&view.roster).to_string());
    }
    lines.extend(view.messages.iter().map(format_message));
    lines
}

fn status_line(status: &ConnectionStatus) -> Option<String> {
    match status {
        ConnectionStatus::ResolvingIdentity => Some("  Loading profile...".to_string()),
        ConnectionStatus::Connecting { attempt: 0 } => Some("  Connecting...".to_string()),
        ConnectionStatus::Connecting { attempt } => {
            Some(format!("  Reconnecting (attempt {attempt})..."))
        }
        ConnectionStatus::Active => Some("  Connected".to_string()),
        ConnectionStatus::Reconnecting {
            attempt,
            last_error,
        } => Some(format!(
            "  Connection lost: {last_error}. Retrying (attempt {attempt})"
        )),
        ConnectionStatus::Closed { .. } => None,
    }
}

fn roster_table(roster: &[Participant]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Present", "Role", "Id"]);

    for participant in roster {
        let role = match participant.role {
            Role::Operator => "operator",
            Role::Member => "member",
        };
        table.add_row(vec![
            participant.display_name.as_str(),
            role,
            participant.id.as_str(),
        ]);
    }
    table
}

/// `[HH:MM:SS] Name: body`; the time is taken from the ISO timestamp as-is.
fn format_message(message: &Message) -> String {
    let time = message.timestamp.get(11..19).unwrap_or(&message.timestamp);
    format!("[{}] {}: {}", time, message.sender_name, message.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        join: JoinArgs,
    }

    fn message(ts: &str) -> Message {
        Message {
            sender_id: "op-1".into(),
            sender_name: "Jane Doe".into(),
            body: "hi".into(),
            timestamp: ts.into(),
        }
    }

    #[test]
    fn formats_message_with_clock_time() {
        assert_eq!(
            format_message(&message("2024-02-29T12:30:15.250Z")),
            "[12:30:15] Jane Doe: hi"
        );
    }

    #[test]
    fn keeps_unparseable_timestamp_verbatim() {
        assert_eq!(format_message(&message("now")), "[now] Jane Doe: hi");
    }

    #[test]
    fn roster_table_lists_every_participant() {
        let roster = vec![
            Participant {
                id: "op-1".into(),
                avatar_url: "a.png".into(),
                display_name: "Jane Doe".into(),
                role: Role::Operator,
            },
            Participant {
                id: "u-2".into(),
                avatar_url: String::new(),
                display_name: "Sam Lee".into(),
                role: Role::Member,
            },
        ];

        let rendered = roster_table(&roster).to_string();

        assert!(rendered.contains("Jane Doe"));
        assert!(rendered.contains("operator"));
        assert!(rendered.contains("Sam Lee"));
        assert!(rendered.contains("member"));
    }

    #[test]
    fn catch_up_lines_cover_identity_roster_and_messages() {
        let view = ChatView {
            identity: Some(OperatorIdentity {
                id: "op-1".into(),
                is_operator: true,
                avatar_url: "a.png".into(),
                display_name: "Jane Doe".into(),
            }),
            status: ConnectionStatus::Active,
            roster: vec![Participant {
                id: "op-1".into(),
                avatar_url: "a.png".into(),
                display_name: "Jane Doe".into(),
                role: Role::Operator,
            }],
            messages: vec![message("2024-02-29T12:30:15.250Z")],
        };

        let lines = view_lines(&view);

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "  Signed in as Jane Doe");
        assert!(lines[1].contains("operator"));
        assert_eq!(lines[2], "[12:30:15] Jane Doe: hi");
    }

    #[test]
    fn catch_up_is_empty_before_anything_arrived() {
        let view = ChatView {
            identity: None,
            status: ConnectionStatus::ResolvingIdentity,
            roster: Vec::new(),
            messages: Vec::new(),
        };
        assert!(view_lines(&view).is_empty());
    }

    #[test]
    fn status_lines_hide_closed() {
        assert_eq!(
            status_line(&ConnectionStatus::Connecting { attempt: 0 }).as_deref(),
            Some("  Connecting...")
        );
        assert!(status_line(&ConnectionStatus::Reconnecting {
            attempt: 2,
            last_error: "reset".into()
        })
        .unwrap_or_default()
        .contains("attempt 2"));
        assert_eq!(status_line(&ConnectionStatus::Closed { error: None }), None);
    }

    #[test]
    fn flags_override_config_file() {
        let cli = TestCli::parse_from([
            "megatrade",
            "--operator-id",
            "op-1",
            "--room",
            "desk",
            "--server",
            "ws://relay:4000",
        ]);
        let mut config = ClientConfig {
            account_api: "http://accounts/api".into(),
            ..ClientConfig::default()
        };

        cli.join.apply(&mut config);

        assert_eq!(config.room, "desk");
        assert_eq!(config.server_url, "ws://relay:4000");
        assert_eq!(config.account_api, "http://accounts/api");
    }

    #[test]
    fn tls_server_flag_fails_validation() {
        let cli = TestCli::parse_from([
            "megatrade",
            "--operator-id",
            "op-1",
            "--server",
            "wss://relay:4000",
        ]);
        let mut config = ClientConfig::default();

        cli.join.apply(&mut config);

        assert!(config.validate().is_err());
    }

    #[test]
    fn closed_with_error_fails_the_command() {
        assert!(closed(None).is_ok());
        let err = closed(Some("Account not found".into())).unwrap_err();
        assert_eq!(err.to_string(), "Account not found");
    }
}
