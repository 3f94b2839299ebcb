//! Parlor — headless chat client.
//!
//! Connects a [`ChatSession`] to a server and bridges it to stdin/stdout:
//! session events are printed as lines, and simple slash commands drive the
//! session. The visual chat UI lives in the embedding application; this
//! binary exists for debugging and soak-testing the session layer.
//!
//! ```bash
//! cargo run --bin parlor -- --ws-url ws://127.0.0.1:8080/chat \
//!     --api-url http://127.0.0.1:8080/api --user-id alice --token t0k3n
//!
//! # Or via environment variables
//! PARLOR_WS_URL=ws://127.0.0.1:8080/chat PARLOR_USER_ID=alice \
//!     PARLOR_TOKEN=t0k3n cargo run --bin parlor
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use parlor::config::{CliArgs, ClientConfig};
use parlor::history::HistoryClient;
use parlor::session::{ChatSession, SessionEvent, SessionPhase};
use parlor::state::Presence;
use parlor::transport::AuthToken;
use parlor::transport::ws::WsTransport;
use parlor_proto::ids::UserId;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("parlor starting");

    let (Some(user_id), Some(token)) = (config.user_id.clone(), config.token.clone()) else {
        eprintln!("user id and token are required (--user-id/--token or config file)");
        return ExitCode::FAILURE;
    };
    let ws_endpoint = match config.ws_endpoint() {
        Ok(Some(url)) => url,
        Ok(None) => {
            eprintln!("a WebSocket endpoint is required (--ws-url or config file)");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let api_endpoint = match config.api_endpoint() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let auth = AuthToken::new(token);
    let history = api_endpoint.map(|base| HistoryClient::new(base, auth.clone()));
    let transport = WsTransport::new(ws_endpoint);

    let (session, events) = ChatSession::spawn(
        UserId::new(user_id),
        auth,
        transport,
        history,
        config.session.clone(),
    );
    session.connect();

    run_repl(&session, events).await;

    session.disconnect();
    tracing::info!("parlor exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Logs go to a file so stdout stays clean for the event stream. Returns a
/// [`WorkerGuard`] that must be held until shutdown so buffered entries are
/// flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("parlor.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Read commands from stdin and print session events until EOF or `/quit`.
async fn run_repl(session: &ChatSession, mut events: tokio::sync::mpsc::Receiver<SessionEvent>) {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(session, &event);
                if matches!(event, SessionEvent::AuthFailed { .. }) {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !dispatch(session, line.trim()) {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        }
    }
}

/// Execute one REPL command. Returns `false` to quit.
fn dispatch(session: &ChatSession, line: &str) -> bool {
    let mut parts = line.splitn(3, ' ');
    match parts.next() {
        Some("/quit") => return false,
        Some("/retry") => session.retry_now(),
        Some("/roster") => print_roster(session),
        Some("/select") => match parts.next() {
            Some(peer) => session.select_conversation(Some(UserId::new(peer))),
            None => session.select_conversation(None),
        },
        Some("/read") => {
            if let Some(peer) = parts.next() {
                session.mark_read(&UserId::new(peer));
            } else {
                println!("usage: /read <user-id>");
            }
        }
        Some("/send") => match (parts.next(), parts.next()) {
            (Some(peer), Some(body)) => {
                let id = session.send_message(&UserId::new(peer), body);
                println!("-> {peer} [{id}]");
            }
            _ => println!("usage: /send <user-id> <text>"),
        },
        Some("") | None => {}
        Some(other) => println!("unknown command: {other}"),
    }
    true
}

fn print_roster(session: &ChatSession) {
    for user in session.state().roster() {
        let presence = match user.presence {
            Presence::Online => "online",
            Presence::Offline => "offline",
        };
        println!("{} ({}) — {presence}, {} unread", user.display_name, user.id, user.unread);
    }
}

fn print_event(session: &ChatSession, event: &SessionEvent) {
    match event {
        SessionEvent::PhaseChanged(phase) => {
            let label = match phase {
                SessionPhase::Disconnected => "disconnected",
                SessionPhase::Connecting => "connecting",
                SessionPhase::Connected => "connected",
                SessionPhase::Reconnecting => "reconnecting",
            };
            println!("* session {label}");
        }
        SessionEvent::MessageReceived { from, client_id } => {
            let body = session
                .state()
                .message(*client_id)
                .map_or_else(String::new, |m| m.body);
            println!("<- {from}: {body}");
        }
        SessionEvent::MessageConfirmed { client_id, .. } => {
            println!("* confirmed [{client_id}]");
        }
        SessionEvent::MessageFailed { client_id } => {
            println!("* failed [{client_id}] — /send again to retry");
        }
        SessionEvent::ReadReceipt { reader, up_to } => {
            println!("* {reader} read up to {}", format_timestamp(up_to.as_millis()));
        }
        SessionEvent::ServerError { message, code } => match code {
            Some(code) => println!("! server error [{code}]: {message}"),
            None => println!("! server error: {message}"),
        },
        SessionEvent::AuthFailed { status } => {
            println!("! authentication rejected (HTTP {status}) — re-authenticate and restart");
        }
    }
}

/// Format an epoch-millisecond timestamp as "HH:MM:SS" local time.
fn format_timestamp(ms: u64) -> String {
    use chrono::{Local, TimeZone};
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format("%H:%M:%S").to_string(),
        _ => "??:??:??".to_string(),
    }
}
