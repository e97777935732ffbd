//! Command line client for the messaging core.
//!
//! Watch a thread live:
//!   incident-chat --token $TOKEN --user-id u1 watch --incident inc-42
//!
//! Send one message:
//!   incident-chat --user-id u1 send --conversation c-7 "On my way"
//!
//! Stream notifications:
//!   incident-chat --user-id u1 notifications

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use incident_chat::{
    ChatClient, ChatConfig, ConnectionStatus, ConversationRef, CurrentUser, DispatchEvent,
    Message, SenderRole, StaticToken,
};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "incident-chat")]
#[command(about = "Incident chat client - watch threads, send messages, stream notifications")]
struct Cli {
    /// Bearer token for the messaging API
    #[arg(long, env = "INCIDENT_CHAT_TOKEN", hide_env_values = true)]
    token: String,

    /// Id of the user to act as
    #[arg(long)]
    user_id: String,

    /// Display name used for optimistic messages
    #[arg(long, default_value = "")]
    user_name: String,

    /// employee, security_team or admin
    #[arg(long, default_value = "employee")]
    role: String,

    /// Config file (defaults to ./incident-chat.{toml,yaml,json} if present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a thread and follow it live
    Watch(Target),
    /// Send one message to a thread
    Send {
        #[command(flatten)]
        target: Target,
        /// Message body
        message: String,
    },
    /// Stream unread counts, toasts and refresh signals
    Notifications,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// Conversation id
    #[arg(long)]
    conversation: Option<String>,

    /// Incident id; the conversation is created if needed
    #[arg(long)]
    incident: Option<String>,
}

impl Target {
    fn reference(&self) -> Result<ConversationRef> {
        match (&self.conversation, &self.incident) {
            (Some(id), None) => Ok(ConversationRef::Conversation(id.clone())),
            (None, Some(id)) => Ok(ConversationRef::Incident(id.clone())),
            _ => bail!("pass exactly one of --conversation or --incident"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ChatConfig::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ChatConfig::load().context("loading config")?,
    };
    let name = if cli.user_name.is_empty() {
        cli.user_id.clone()
    } else {
        cli.user_name.clone()
    };
    let user = CurrentUser::new(cli.user_id.clone(), name, SenderRole::from_wire(&cli.role));
    let client = ChatClient::connect(config, Arc::new(StaticToken::new(cli.token.clone())), user)
        .context("building client")?;

    match cli.command {
        Command::Watch(target) => watch(&client, target.reference()?).await,
        Command::Send { target, message } => send(&client, target.reference()?, &message).await,
        Command::Notifications => notifications(&client).await,
    }
}

async fn watch(client: &ChatClient, reference: ConversationRef) -> Result<()> {
    let thread = client.thread_session();
    let conversation = thread.open(reference).await.context("opening thread")?;
    println!(
        "== {} ({}) ==",
        conversation.title.as_deref().unwrap_or("untitled"),
        conversation.id
    );

    let mut printed = HashSet::new();
    let mut timeline = thread.watch_messages();
    let mut status = thread.watch_connection();
    print_new(&timeline.borrow_and_update(), &mut printed);

    loop {
        tokio::select! {
            changed = timeline.changed() => {
                if changed.is_err() {
                    break;
                }
                print_new(&timeline.borrow_and_update(), &mut printed);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                print_status(&status.borrow_and_update());
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    thread.teardown();
    Ok(())
}

async fn send(client: &ChatClient, reference: ConversationRef, content: &str) -> Result<()> {
    let thread = client.thread_session();
    thread.open(reference).await.context("opening thread")?;
    let sent = thread
        .send(content, Vec::new())
        .await
        .context("sending message")?;
    println!("sent {}", sent.id);
    thread.teardown();
    Ok(())
}

async fn notifications(client: &ChatClient) -> Result<()> {
    let dispatcher = client.notification_dispatcher();
    let mut events = dispatcher.subscribe();
    dispatcher.start();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DispatchEvent::UnreadCount(count)) => println!("unread: {count}"),
                Ok(DispatchEvent::Toast(toast)) => {
                    println!("[{:?}] {}: {}", toast.level, toast.title, toast.message);
                }
                Ok(DispatchEvent::Refresh { topic, .. }) => println!("refresh: {topic:?}"),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    println!("(skipped {skipped} events)");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    dispatcher.stop();
    Ok(())
}

fn print_new(messages: &[Message], printed: &mut HashSet<String>) {
    for message in messages {
        if printed.insert(message.id.clone()) {
            println!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M:%S"),
                if message.sender_name.is_empty() {
                    &message.sender_id
                } else {
                    &message.sender_name
                },
                message.content
            );
        }
    }
}

fn print_status(status: &ConnectionStatus) {
    match &status.last_error {
        Some(error) => println!("-- {:?} (retry {}): {}", status.state, status.retry_count, error),
        None => println!("-- {:?}", status.state),
    }
}
