use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{load_settings, ControllerEvent, KeyboardController};
use shared::domain::KeyEventKind;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Launch the keyboard backend and follow its events")]
struct Args {
    /// Backend executable, overriding `backend_entrypoint` from settings.
    #[arg(long)]
    entrypoint: Option<PathBuf>,
    /// Backend arguments, overriding `backend_args` from settings.
    #[arg(long = "arg", value_name = "ARG")]
    args: Vec<String>,
    #[arg(long)]
    debug: bool,
    /// Start tracking as soon as a transport is up.
    #[arg(long)]
    track: bool,
    /// Stay on HTTP and skip WebSocket negotiation.
    #[arg(long)]
    no_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(entrypoint) = args.entrypoint {
        settings.backend_entrypoint = entrypoint;
    }
    if !args.args.is_empty() {
        settings.backend_args = args.args;
    }
    settings.debug |= args.debug;
    let grace = settings.startup_grace;

    let controller = KeyboardController::new(settings);
    let mut notifications = controller.event_stream();

    let endpoint = controller
        .start_session()
        .await
        .context("starting keyboard backend")?;
    println!("Backend listening on {}", endpoint.http_base());
    tokio::time::sleep(grace).await;

    if !args.no_connect {
        let state = controller.connect().await?;
        println!("Transport: {state}");
    }
    if args.track {
        match controller.toggle().await {
            Ok(outcome) if outcome.success => println!("Tracking started"),
            Ok(outcome) => println!("{}", outcome.message),
            Err(err) => warn!(error = %err, "keytrack: could not start tracking"),
        }
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            next = notifications.next() => match next {
                Some(Ok(event)) => print_event(&event),
                Some(Err(lagged)) => warn!(error = %lagged, "keytrack: missed notifications"),
                None => break,
            },
        }
    }

    info!("keytrack: shutting down");
    controller.stop_session().await;
    Ok(())
}

fn print_event(event: &ControllerEvent) {
    match event {
        ControllerEvent::EventRecorded(key) => {
            let arrow = match key.kind {
                KeyEventKind::Press => "v",
                KeyEventKind::Release => "^",
            };
            println!("{arrow} {} @ {:.3}", key.key, key.timestamp_seconds);
        }
        ControllerEvent::EventsReplaced { count } => println!("[{count} events]"),
        ControllerEvent::ConnectionChanged(state) => println!("Transport: {state}"),
        ControllerEvent::TrackingChanged(tracking) => {
            println!("Tracking: {}", if tracking.enabled { "on" } else { "off" })
        }
        ControllerEvent::CommandCompleted(outcome) if !outcome.message.is_empty() => {
            println!("{}: {}", outcome.command, outcome.message)
        }
        ControllerEvent::KeyboardAvailability(false) => println!("Keyboard hardware unavailable"),
        ControllerEvent::Status(text) => println!("{text}"),
        _ => {}
    }
}
