//! Line-oriented client connection over stdin/stdout.
//!
//! Each input line is a text command (`P3:a harbour at dusk`). Output lines use
//! the wire vocabulary; binary frames are shown as their size. Events of a
//! superseded session are drained but not printed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use genstream_application::{SessionHandle, SessionManager};
use genstream_core::{ConnectionId, InterruptReason, WireMessage};
use genstream_infrastructure::{ConfigService, SimulatedEngine};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use super::utils;

#[derive(Debug, Args)]
pub struct ReplArgs {
    /// Simulated per-step latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub step_delay_ms: u64,
}

pub async fn run(config: &ConfigService, args: ReplArgs) -> Result<()> {
    let manager = Arc::new(utils::build_manager(config, args.step_delay_ms)?);
    let connection_id = manager.registry().connect();
    eprintln!("connected as {connection_id}; commands: <PROGRAM>[:params], stop, evict, quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarders: Vec<JoinHandle<()>> = Vec::new();

    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            "stop" => {
                if manager
                    .registry()
                    .interrupt_active(connection_id, InterruptReason::Requested)
                    .is_none()
                {
                    eprintln!("no active session");
                }
                continue;
            }
            "evict" => {
                eprintln!("evicted {} idle pipelines", manager.evict_idle());
                continue;
            }
            _ => {}
        }

        match manager.handle_text(connection_id, line) {
            Ok(handle) => {
                emit(WireMessage::ready());
                forwarders.push(tokio::spawn(forward(
                    Arc::clone(&manager),
                    connection_id,
                    handle,
                )));
            }
            Err(err) if err.is_configuration() => emit(WireMessage::unknown_command(line)),
            Err(err) => emit(WireMessage::Text(format!("error:{err}"))),
        }
    }

    manager.registry().disconnect(connection_id);
    for forwarder in forwarders {
        forwarder.await.context("Event forwarder panicked")?;
    }
    manager.evict_idle();
    Ok(())
}

async fn forward(
    manager: Arc<SessionManager<SimulatedEngine>>,
    connection_id: ConnectionId,
    handle: SessionHandle,
) {
    let session_id = handle.session_id();
    let (mut events, completion) = handle.split();
    while let Some(event) = events.next_event().await {
        if manager.is_current(connection_id, session_id) {
            emit(WireMessage::from(event));
        }
    }
    match completion.wait().await {
        Ok(summary) => tracing::debug!(
            target: "router",
            session_id = %session_id,
            state = %summary.state,
            steps = summary.steps_completed,
            "session finished"
        ),
        Err(err) => tracing::warn!(target: "router", session_id = %session_id, error = %err, "session task lost"),
    }
}

fn emit(message: WireMessage) {
    match message {
        WireMessage::Text(text) => println!("{text}"),
        WireMessage::Binary(bytes) => println!("<binary {} bytes>", bytes.len()),
    }
}
