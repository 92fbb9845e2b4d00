//! Parley: line-oriented chat client.
//!
//! Connects to a chat server, keeps conversations in sync and tracks delivery
//! of everything you send. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/parley/config.toml`).
//!
//! ```bash
//! cargo run --bin parley -- --server-url ws://127.0.0.1:9000/ws \
//!     --api-url http://127.0.0.1:9000 --user-id 42
//! ```
//!
//! Input lines are sent to the current conversation. Commands:
//! `/open <id>`, `/close`, `/list`, `/search <text>`, `/history`,
//! `/attach <path> [text]`, `/quit`. Conversation ids are a user id,
//! `grupo_<room>`, or `grupo_general`.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use parley::chat::model::{Attachment, ConversationId, DeliveryState, Message};
use parley::chat::store::FileStore;
use parley::config::{CliArgs, ClientConfig};
use parley::connection::ConnectionManager;
use parley::directory::HttpDirectory;
use parley::notify::{Notifier, SilentNotifier, TerminalNotifier};
use parley::session::{
    self, ConnectionStatus, ConversationSummary, SessionCommand, SessionEvent,
};
use parley_proto::ids::Timestamp;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Logs go to a file; stdout belongs to the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("parley starting");

    let result = if config.notifications {
        run(&config, TerminalNotifier).await
    } else {
        run(&config, SilentNotifier).await
    };

    tracing::info!("parley exiting");
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("parley.log");
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

/// Wires the session and runs the input loop until `/quit`, end of input or
/// a fatal connection error.
async fn run<N: Notifier + 'static>(
    config: &ClientConfig,
    notifier: N,
) -> Result<(), Box<dyn std::error::Error>> {
    let connection_config = config.to_connection_config()?;
    let session_config = config.to_session_config()?;
    let directory = HttpDirectory::new(config.api_url()?, config.http_timeout)?;
    let store = FileStore::in_dir(&config.store_dir());
    tracing::info!(url = %connection_config.url, store = %store.path().display(), "starting session");

    let (link, connection_events) = ConnectionManager::new(connection_config);
    let mut handle = session::spawn(
        session_config,
        link,
        connection_events,
        store,
        directory,
        notifier,
    );

    let mut ui = Ui {
        current: None,
        conversations: Vec::new(),
        timestamp_format: config.timestamp_format.clone(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let fatal = loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break None };
                match ui.parse(&line).await {
                    Input::Quit => break None,
                    Input::Command(command) => {
                        if handle.commands.send(command).await.is_err() {
                            break None;
                        }
                    }
                    Input::Local(text) => println!("{text}"),
                    Input::Nothing => {}
                }
            }
            event = handle.events.recv() => match event {
                Some(SessionEvent::Fatal(reason)) => break Some(reason),
                Some(event) => ui.render(&event),
                None => break None,
            },
        }
    };

    handle.shutdown().await;
    match fatal {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

enum Input {
    Command(SessionCommand),
    Local(String),
    Quit,
    Nothing,
}

struct Ui {
    current: Option<ConversationId>,
    conversations: Vec<ConversationSummary>,
    timestamp_format: String,
}

impl Ui {
    async fn parse(&mut self, line: &str) -> Input {
        let line = line.trim();
        if line.is_empty() {
            return Input::Nothing;
        }
        let (word, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        match word {
            "/quit" => Input::Quit,
            "/list" => Input::Local(self.listing()),
            "/open" => match rest.parse::<ConversationId>() {
                Ok(id) => {
                    self.current = Some(id.clone());
                    Input::Command(SessionCommand::Focus(id))
                }
                Err(e) => Input::Local(e.to_string()),
            },
            "/close" => {
                self.current = None;
                Input::Command(SessionCommand::Unfocus)
            }
            "/search" => Input::Command(SessionCommand::SearchDirectory(rest.to_string())),
            "/history" => match &self.current {
                Some(id) => Input::Command(SessionCommand::LoadHistory(id.clone())),
                None => Input::Local("open a conversation first".into()),
            },
            "/attach" => {
                let Some(to) = self.current.clone() else {
                    return Input::Local("open a conversation first".into());
                };
                let (path, body) = rest.split_once(' ').unwrap_or((rest, ""));
                match read_attachment(Path::new(path)).await {
                    Ok(attachment) => Input::Command(SessionCommand::Send {
                        to,
                        body: body.to_string(),
                        attachment: Some(attachment),
                    }),
                    Err(e) => Input::Local(format!("cannot read {path}: {e}")),
                }
            }
            _ if word.starts_with('/') => Input::Local(format!("unknown command {word}")),
            _ => match &self.current {
                Some(to) => Input::Command(SessionCommand::Send {
                    to: to.clone(),
                    body: line.to_string(),
                    attachment: None,
                }),
                None => Input::Local("open a conversation first (/open <id>)".into()),
            },
        }
    }

    fn listing(&self) -> String {
        if self.conversations.is_empty() {
            return "no conversations yet".into();
        }
        self.conversations
            .iter()
            .map(|s| {
                let unread = if s.unread > 0 {
                    format!(" ({} unread)", s.unread)
                } else {
                    String::new()
                };
                format!(
                    "  {:<16} {}{unread}  {}",
                    s.id.to_string(),
                    s.display_name,
                    s.preview.as_deref().unwrap_or("")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn render(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::Connection(status) => match status {
                ConnectionStatus::Connected { reconnected: false } => println!("* connected"),
                ConnectionStatus::Connected { reconnected: true } => println!("* reconnected"),
                ConnectionStatus::Disconnected { reason } => println!("* disconnected: {reason}"),
                ConnectionStatus::Reconnecting {
                    attempt,
                    max_attempts,
                } => println!("* reconnecting ({attempt}/{max_attempts})"),
                ConnectionStatus::Offline => println!("* offline"),
            },
            SessionEvent::MessageAppended {
                conversation,
                message,
            } => {
                if self.current.as_ref() == Some(conversation) {
                    println!("{}", self.format_message(message));
                }
            }
            SessionEvent::DeliveryChanged {
                correlation_id,
                delivery: DeliveryState::Delivered,
                ..
            } => tracing::debug!(%correlation_id, "delivered"),
            SessionEvent::DeliveryChanged { .. } => {}
            SessionEvent::Notification(_) => {}
            SessionEvent::Conversations(summaries) => {
                self.conversations.clone_from(summaries);
            }
            SessionEvent::DirectoryResults(entries) => {
                for entry in entries {
                    println!("  {} {} [{}]", entry.id, entry.nombre, entry.rol);
                }
            }
            SessionEvent::HistoryLoaded {
                conversation,
                added,
            } => println!("* {added} older message(s) loaded into {conversation}"),
            SessionEvent::Notice(text) => println!("! {text}"),
            SessionEvent::Fatal(text) => println!("!! {text}"),
        }
    }

    fn format_message(&self, message: &Message) -> String {
        let marker = match message.delivery {
            DeliveryState::Pending => " (sending)",
            DeliveryState::Delivered => "",
        };
        let attachment = message
            .attachment
            .as_ref()
            .map(|a| format!(" [{} bytes: {}]", a.bytes.len(), a.file_name))
            .unwrap_or_default();
        format!(
            "[{}] {}: {}{attachment}{marker}",
            format_timestamp(message.timestamp, &self.timestamp_format),
            message.sender_id,
            message.body.preview(usize::MAX),
        )
    }
}

async fn read_attachment(path: &Path) -> std::io::Result<Attachment> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(Attachment { file_name, bytes })
}

/// Formats an epoch-millisecond timestamp in local time.
fn format_timestamp(ts: Timestamp, format: &str) -> String {
    use std::fmt::Write;

    use chrono::{Local, TimeZone};
    let ms = ts.as_millis();
    let secs = (ms / 1000).cast_signed();
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    let chrono::LocalResult::Single(dt) = Local.timestamp_opt(secs, nsecs) else {
        return "??:??".to_string();
    };
    let mut out = String::new();
    if write!(out, "{}", dt.format(format)).is_err() {
        out.clear();
        let _ = write!(out, "{}", dt.format("%H:%M"));
    }
    out
}
