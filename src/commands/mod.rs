//! # Commands Module
//!
//! The three command handlers of the `codedrop` binary:
//!
//! ## `send`
//! Sends a file, several paths as one bundle, or a text message:
//! - Allocates a code on the mailbox broker and prints it
//! - Waits for the receiver, confirms the key, connects directly or via relay
//! - Streams the payload with a progress bar
//!
//! ## `receive`
//! Receives with a code typed on the command line or at a prompt:
//! - Asks before accepting unless `--accept` is given
//! - Writes files and bundles into the output directory, prints text
//!
//! ## `relay`
//! Runs the transit relay that splices peers which cannot connect directly.

pub mod receive;
pub mod relay;
pub mod send;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::config::Config;
use crate::error::ErrorCategory;
use crate::mailbox::TcpBroker;
use crate::networking::TcpTransport;
use crate::session::{Client, SessionEvent, SessionHandle, SessionState, TransferSummary};
use crate::transit::ConnectionKind;

/// Client talking to the configured broker over TCP.
pub fn network_client(config: Config) -> Result<Client, Box<dyn Error>> {
    let broker = Arc::new(TcpBroker::new(config.broker_addr.clone()));
    Ok(Client::new(config, broker, Arc::new(TcpTransport::new()))?)
}

fn progress_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] [{bar:40.black}] {bytes}/{total_bytes} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

fn failure_headline(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::PeerMissing => "The code was wrong, already used, or the other side never showed up",
        ErrorCategory::Network => "Could not reach the other side",
        ErrorCategory::Tampering => "Transfer aborted because data was altered in transit",
        ErrorCategory::Local => "Local error",
        ErrorCategory::UserAction => "Transfer stopped",
    }
}

pub fn describe_connection(kind: ConnectionKind) -> &'static str {
    match kind {
        ConnectionKind::Direct => "direct",
        ConnectionKind::Relayed => "relayed",
    }
}

/// Render a session's events until it ends. Ctrl-C cancels the session and
/// keeps waiting for it to wind down.
pub async fn watch(client: &Client, mut handle: SessionHandle) -> Result<TransferSummary, Box<dyn Error>> {
    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Starting");
    let mut bar: Option<ProgressBar> = None;

    loop {
        let event = tokio::select! {
            event = handle.next_event() => event,
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted, cancelling session {}", handle.id());
                client.cancel(handle.id());
                continue;
            }
        };

        match event {
            None => return Err("session ended without a result".into()),
            Some(SessionEvent::CodeGenerated(code)) => {
                spinner.println(format!("Code: \x1b[4m\x1b[1m{}\x1b[0m", code));
                spinner.println(format!("On the other machine run: codedrop receive {}", code));
                spinner.set_message("Waiting for receiver");
            }
            // The receiver may be prompted next, keep the terminal quiet.
            Some(SessionEvent::State(SessionState::Transferring)) => spinner.finish_and_clear(),
            Some(SessionEvent::State(state)) => spinner.set_message(capitalise(&state.to_string())),
            Some(SessionEvent::Progress(done, total)) => {
                bar.get_or_insert_with(|| progress_bar(total)).set_position(done);
            }
            Some(SessionEvent::Message(_)) => {}
            Some(SessionEvent::Completed(summary)) => {
                spinner.finish_and_clear();
                if let Some(bar) = bar {
                    bar.finish_with_message("done");
                }
                return Ok(summary);
            }
            Some(SessionEvent::Failed(kind, detail)) => {
                spinner.finish_and_clear();
                if let Some(bar) = bar {
                    bar.abandon();
                }
                return Err(format!("{} ({}): {}", failure_headline(kind.category()), kind, detail).into());
            }
            Some(SessionEvent::Cancelled) => {
                spinner.finish_and_clear();
                if let Some(bar) = bar {
                    bar.abandon_with_message("cancelled");
                }
                return Err("Transfer cancelled".into());
            }
        }
    }
}

fn capitalise(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
