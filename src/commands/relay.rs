use std::error::Error;

use log::info;
use tokio::net::TcpListener;

use crate::relay_utils;

/// Run the transit relay used when two peers cannot connect directly.
///
/// # Overview
/// The relay pairs exactly two TCP connections that present the same relay
/// token with opposite roles, then copies bytes between them:
/// 1. A client connects and sends a length-prefixed `RelayHello`
/// 2. The connection waits until its peer arrives with the same token
/// 3. Both get a one-byte acknowledgement and are spliced together
///
/// Everything after the acknowledgement is sealed with a key the relay never
/// learns, so it only forwards ciphertext.
///
/// # Arguments
/// * `port` - The port number to bind the relay to
pub async fn run(port: u16) -> Result<(), Box<dyn Error>> {
    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&bind_addr).await?;
    println!("Relay listening on {}", bind_addr);
    info!("Relay server started on {}", bind_addr);

    relay_utils::serve(listener).await?;
    Ok(())
}
