// cowrite: line-oriented driver for the sync client.
//
// Plain lines are appended to the shared document and `/`-commands issue AI
// actions. Status changes and server events are printed as they arrive.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cowrite_client::config::{AutoTriggerSettings, ClientConfig};
use cowrite_client::persistence::PersistenceHandle;
use cowrite_client::runtime::{self, ClientEvent, ClientHandle, ClientOptions};
use cowrite_client::session::{parse_server_url, WsTransport};
use cowrite_client::status::AiActivity;
use cowrite_common::protocol::control::{AgentPayload, AiAction, AiCommandPayload};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

const HELP: &str = "\
commands:
  /improve /fix /longer /shorter   refine the whole document
  /continue /custom /toggle        send the document with an AI command
  /agent                           ask the configured agent role to write
  /cancel                          ignore whatever the current request returns
  /auto on|off                     toggle the auto-trigger
  /text                            print the document
  /quit                            flush and exit
anything else is appended as a new line";

#[derive(Parser)]
#[command(name = "cowrite", about = "Collaborative writing client")]
struct Cli {
    /// Config file. Defaults to ~/.cowrite/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,
    /// WebSocket URL of the server, overriding the config file.
    #[arg(long)]
    server: Option<String>,
    /// Document id to open.
    #[arg(long, default_value = "default")]
    doc: String,
    /// Keep the replica in memory only.
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load_from(path)
            .with_context(|| format!("failed to load config `{}`", path.display()))?,
        None => ClientConfig::load(),
    };
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let url = parse_server_url(&config.server_url)?;
    let options = ClientOptions::from_config(cli.doc.clone(), &config)?;
    let (transport, transport_events) = WsTransport::channel();

    let doc_id = cli.doc.clone();
    let store_path = if cli.ephemeral { None } else { config.resolved_store_path() };
    let store = async move {
        match store_path {
            Some(path) => PersistenceHandle::open_sqlite(doc_id, path).await,
            None => PersistenceHandle::ephemeral(doc_id),
        }
    };

    info!(doc_id = %cli.doc, server = %url, "starting cowrite client");
    let client = runtime::spawn(url, transport, transport_events, store, options)?;
    let handle = client.handle();
    let printer = tokio::spawn(print_updates(handle.clone()));
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if !handle_line(&handle, &config.auto_trigger, line.trim_end()).await? {
            break;
        }
    }

    client.shutdown().await?;
    printer.abort();
    Ok(())
}

/// Returns false once the user asked to quit.
async fn handle_line(handle: &ClientHandle, auto: &AutoTriggerSettings, line: &str) -> Result<bool> {
    let Some(command) = line.strip_prefix('/') else {
        handle.append(format!("{line}\n"))?;
        return Ok(true);
    };

    match command.trim() {
        "quit" | "q" => return Ok(false),
        "help" => println!("{HELP}"),
        "cancel" => {
            handle.cancel_ai();
            println!("[ai] current request cancelled");
        }
        "auto on" => handle.set_auto_trigger(true)?,
        "auto off" => handle.set_auto_trigger(false)?,
        "text" => println!("{}", handle.text().await?),
        "agent" => {
            let payload = AiCommandPayload::Agent(AgentPayload { role: auto.role.clone() });
            report_request(handle.request_ai(AiAction::Agent, Some(payload)).await);
        }
        name => match name.parse::<AiAction>() {
            Ok(action) if action.refine_endpoint().is_some() && handle.has_refine_service() => {
                tokio::spawn(refine_document(handle.clone(), action));
            }
            Ok(action) => {
                let text = handle.text().await?;
                report_request(handle.request_ai(action, Some(AiCommandPayload::Text(text))).await);
            }
            Err(error) => println!("{error}; try /help"),
        },
    }
    Ok(true)
}

async fn refine_document(handle: ClientHandle, action: AiAction) {
    let text = match handle.text().await {
        Ok(text) => text,
        Err(error) => {
            println!("[{action}] {error:#}");
            return;
        }
    };
    match handle.refine(action, &text).await {
        Ok(Some(refined)) => {
            if handle.replace_all(refined).is_ok() {
                println!("[{action}] applied");
            }
        }
        Ok(None) => println!("[{action}] superseded; result discarded"),
        Err(error) => println!("[{action}] failed: {error}"),
    }
}

fn report_request(sent: Result<u64>) {
    match sent {
        Ok(request_id) => println!("[ai] request #{request_id} sent"),
        Err(error) => println!("[ai] {error:#}"),
    }
}

async fn print_updates(handle: ClientHandle) {
    let mut events = handle.subscribe_events();
    let mut status = handle.status();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => println!("[events] {skipped} events skipped"),
                Err(RecvError::Closed) => break,
            },
            Ok(()) = status.connection.changed() => println!("[connection] {}", status.connection()),
            Ok(()) = status.local_synced.changed() => {
                if status.is_local_synced() {
                    let stats = status.stats();
                    println!("[local] loaded {} chars, {} words", stats.chars, stats.words);
                }
            }
            Ok(()) = status.ai.changed() => print_activity(&status.ai()),
            Ok(()) = status.countdown.changed() => {
                if let Some(seconds) = status.countdown() {
                    println!("[auto] firing in {seconds}s");
                }
            }
        }
    }
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::ServerSynced => println!("[sync] up to date with server"),
        ClientEvent::Comment(comment) => {
            println!("[comment on \"{}\"] {}", comment.comment_on, comment.comment);
        }
        ClientEvent::AiResult { request_id, message } => match request_id {
            Some(id) => println!("[ai #{id}] result:\n{message}"),
            None => println!("[ai] result:\n{message}"),
        },
        ClientEvent::AutoTriggered { request_id, action } => {
            println!("[auto] sent {action} as request #{request_id}");
        }
        // Failures are reported through the AI status.
        ClientEvent::AiFailed { .. } => {}
    }
}

fn print_activity(activity: &AiActivity) {
    match activity {
        AiActivity::Idle => {}
        AiActivity::Requested { request_id, action } => println!("[ai #{request_id}] {action} requested"),
        AiActivity::Thinking { message, .. } => println!("[ai] thinking: {message}"),
        AiActivity::Done { message, .. } => println!("[ai] done: {message}"),
        AiActivity::Failed { message, .. } => println!("[ai] error: {message}"),
    }
}
