//! live-agent - talk to a live multimodal model from the terminal
//!
//! Reads commands from stdin, drives a session coordinator with the native
//! device backends, and prints status changes, model text and errors.

use anyhow::{Context, Result};
use live_agent::{Backends, Command, SessionConfig, SessionCoordinator, SessionEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const HELP: &str = "\
commands:
  /connect             open the live session
  /disconnect          close it
  /mic on|off          toggle the microphone
  /mic use <id>        select a microphone (PulseAudio source name)
  /cam on|off          toggle the camera
  /cam use <id>        select a camera (index or name)
  /screen on|off       toggle screen sharing
  /quit                exit
anything else is sent as a text turn";

/// Parse one input line. `Err` carries a usage message.
fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::SendText(line.to_string())));
    }

    let mut words = line.split_whitespace();
    let head = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    let toggle = |args: &[&str]| match args {
        ["on"] => Ok(true),
        ["off"] => Ok(false),
        _ => Err(format!("usage: {} on|off", head)),
    };
    let device = |args: &[&str]| match args {
        [] | ["default"] => None,
        _ => Some(args.join(" ")),
    };

    let cmd = match (head, args.as_slice()) {
        ("/connect", []) => Command::Connect,
        ("/disconnect", []) => Command::Disconnect,
        ("/quit", []) => Command::Shutdown,
        ("/mic", ["use", rest @ ..]) => Command::SwitchMicrophone(device(rest)),
        ("/mic", rest) => Command::SetMicrophone(toggle(rest)?),
        ("/cam", ["use", rest @ ..]) => Command::SwitchCamera(device(rest)),
        ("/cam", rest) => Command::SetCamera(toggle(rest)?),
        ("/screen", rest) => Command::SetScreen(toggle(rest)?),
        _ => return Err(HELP.to_string()),
    };
    Ok(Some(cmd))
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Text { content, .. }) => println!("model: {}", content),
            Ok(SessionEvent::TurnComplete) => println!("[turn complete]"),
            Ok(SessionEvent::SetupComplete) => println!("[session ready]"),
            Ok(SessionEvent::Error(reason)) => eprintln!("error: {}", reason),
            Err(broadcast::error::RecvError::Lagged(n)) => warn!("Skipped {} session events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = SessionConfig::from_env().context("loading LIVE_* configuration")?;
    info!("Using model {}", config.model_uri());

    let coordinator = SessionCoordinator::new(config, Backends::native());
    let mut status = coordinator.watch_status();
    tokio::spawn(print_events(coordinator.subscribe()));
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            println!("[{}]", current.as_str());
        }
    });

    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let session = tokio::spawn(coordinator.run(cmd_rx));

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        match parse_command(&line) {
            Ok(Some(cmd)) => {
                let quit = cmd == Command::Shutdown;
                if cmd_tx.send(cmd).await.is_err() || quit {
                    break;
                }
            }
            Ok(None) => {}
            Err(usage) => eprintln!("{}", usage),
        }
    }

    // closing the channel stops the coordinator
    drop(cmd_tx);
    session.await.context("session task panicked")?;
    Ok(())
}
