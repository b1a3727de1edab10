use std::error::Error;
use std::path::PathBuf;

use log::debug;

use crate::config::Config;
use crate::session::SendRequest;

use super::{describe_connection, network_client, watch};

/// Function handler to kick off a send:
///     - Validate the input (paths that exist, or a text message)
///     - Allocate a code and print it for the receiver
///     - Pair, connect and stream the payload while rendering progress
pub async fn run(paths: Vec<String>, text: Option<String>, config: Config) -> Result<(), Box<dyn Error>> {
    let request = match text {
        Some(text) => {
            if !paths.is_empty() {
                return Err("--text cannot be combined with paths".into());
            }
            SendRequest::Text(text)
        }
        None => SendRequest::Paths(existing_paths(&paths)?),
    };

    let client = network_client(config)?;
    debug!("Sending via broker {}", client.config().broker_addr);
    let summary = watch(&client, client.send(request)).await?;

    println!(
        "Sent {} ({} bytes, {} connection)",
        summary.offer.display_name(),
        summary.bytes,
        describe_connection(summary.connection)
    );
    Ok(())
}

fn existing_paths(paths: &[String]) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    if paths.is_empty() {
        return Err("nothing to send: give one or more paths, or --text".into());
    }
    paths
        .iter()
        .map(|path| {
            let path = PathBuf::from(path);
            if path.exists() { Ok(path) } else { Err(format!("Path does not exist: {}", path.display()).into()) }
        })
        .collect()
}
