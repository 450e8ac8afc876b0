//! Scribe CLI: join a document's collaboration room from a terminal.
//!
//! Every line typed on stdin is appended to the shared document as a
//! paragraph. Presence changes and the final document are printed.
//!
//! ```text
//! SCRIBE_COLLAB_WS_URL=ws://localhost:1234/collab scribe 42 --name Ada
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use scribe_collab::presence::{ParticipantId, UserIdentity};
use scribe_collab::session::{Collaboration, SessionOptions, SessionState, SyncSession};
use scribe_collab::surface::BufferSurface;
use scribe_collab::CollabConfig;

#[derive(Parser, Debug)]
#[command(name = "scribe", about = "Terminal participant for Scribe collaboration rooms")]
struct Args {
    /// Document to open
    document: String,

    /// Collaboration endpoint (overrides SCRIBE_COLLAB_WS_URL)
    #[arg(long)]
    endpoint: Option<String>,

    /// Origin used to resolve relative endpoints
    #[arg(long)]
    origin: Option<String>,

    /// Participant id announced to the room
    #[arg(long)]
    user_id: Option<String>,

    /// Display name announced to the room
    #[arg(long, default_value = "Terminal")]
    name: String,

    /// Initial content: a JSON document, or plain text (one paragraph per line)
    #[arg(long)]
    initial: Option<PathBuf>,

    /// Open without joining the room
    #[arg(long)]
    readonly: bool,
}

fn load_initial(path: &PathBuf) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading initial content from {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        return serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()));
    }
    Ok(Value::String(raw))
}

fn identity(args: &Args) -> UserIdentity {
    let id = match args.user_id.as_deref() {
        Some(raw) => match raw.parse::<i64>() {
            Ok(n) => ParticipantId::Number(n),
            Err(_) => ParticipantId::Text(raw.to_string()),
        },
        None => ParticipantId::Text(format!("cli-{}", std::process::id())),
    };
    UserIdentity::new(id, args.name.clone())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = CollabConfig::from_env();
    if let Some(endpoint) = &args.endpoint {
        config = config.with_endpoint(endpoint.clone());
    }
    if let Some(origin) = &args.origin {
        config = config.with_origin(origin.clone());
    }

    let mut options = SessionOptions::new()
        .readonly(args.readonly)
        .identity(identity(&args))
        .on_presence_count(|count| println!("* {count} participant(s) in the room"))
        .on_presence_list(|participants| {
            for p in participants {
                println!("  - {} ({}) {}", p.display_name, p.id, p.color);
            }
        });
    if let Some(path) = &args.initial {
        options = options.initial_content(load_initial(path)?);
    }

    let collab = Collaboration::new(SyncSession::new(config));
    let Some(handle) = collab.enable(Some(args.document.as_str()), options) else {
        bail!("collaboration is not available for document {}", args.document);
    };

    collab.set_editor(Arc::new(BufferSurface::new()));
    info!("Joined room {}; type lines to append, Ctrl-C to leave", handle.room());

    let replica = handle.replica();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut state = handle.watch_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                info!("Session is {current}");
                if current == SessionState::Destroyed {
                    break;
                }
            }
            line = lines.next_line() => match line? {
                Some(text) if !text.trim().is_empty() => {
                    let block = json!({"type": "paragraph", "content": [{"type": "text", "text": text.trim()}]});
                    replica.push_block(&block).context("appending to the shared document")?;
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    match replica.document() {
        Ok(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
        Err(e) => log::warn!("Could not read the shared document: {e}"),
    }
    info!("Leaving with {} participant(s) in the room", collab.participant_count());
    collab.disable();
    Ok(())
}
