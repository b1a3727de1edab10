use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use log::{debug, info};

use crate::bytes::OutputTarget;
use crate::config::Config;
use crate::session::ReceiveOptions;
use crate::transfer::{AcceptPolicy, OfferKind, ReceivedPayload, TransferOffer};

use super::{describe_connection, network_client, watch};

pub async fn run(
    code: Option<String>,
    output_dir: Option<PathBuf>,
    accept: bool,
    config: Config,
) -> Result<(), Box<dyn Error>> {
    let code = match code {
        Some(code) => code,
        None => {
            info!("Prompting for code");
            prompt_for_code()?
        }
    };

    let output_dir = match output_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    fs::create_dir_all(&output_dir)?;
    debug!("Writing received payloads to {}", output_dir.display());

    let policy = if accept { AcceptPolicy::AutoAccept } else { AcceptPolicy::ask(confirm_offer) };
    let client = network_client(config)?;
    let handle = client.receive(&code, ReceiveOptions::new(policy, OutputTarget::Directory(output_dir)));
    let summary = watch(&client, handle).await?;

    match summary.received {
        Some(ReceivedPayload::Text(text)) => println!("{}", text),
        Some(ReceivedPayload::File(path)) => println!("File saved: {}", path.display()),
        Some(ReceivedPayload::Bundle(paths)) => {
            for path in paths {
                println!("Saved: {}", path.display());
            }
        }
        Some(ReceivedPayload::Memory(bytes)) => println!("Received {} bytes", bytes.len()),
        None => {}
    }
    debug!("Received over a {} connection", describe_connection(summary.connection));
    Ok(())
}

fn prompt_for_code() -> Result<String, Box<dyn Error>> {
    print!("Enter code: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let code = line.trim().to_string();
    if code.is_empty() {
        return Err("no code entered".into());
    }
    Ok(code)
}

fn describe_offer(offer: &TransferOffer) -> String {
    match offer.kind {
        OfferKind::Text => format!("a text message ({} bytes)", offer.total_size),
        OfferKind::File => format!("file '{}' ({} bytes)", offer.display_name(), offer.total_size),
        OfferKind::Bundle => format!(
            "{} item(s) starting with '{}' ({} bytes zipped)",
            offer.names.len(),
            offer.display_name(),
            offer.total_size
        ),
    }
}

/// Runs on a blocking thread while the session waits.
fn confirm_offer(offer: &TransferOffer) -> bool {
    print!("Accept {}? [y/N] ", describe_offer(offer));
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    if io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_offer() {
        assert_eq!(describe_offer(&TransferOffer::text(5)), "a text message (5 bytes)");
        assert_eq!(describe_offer(&TransferOffer::file("a.bin", 9)), "file 'a.bin' (9 bytes)");
        let bundle = TransferOffer::bundle(vec!["docs".into(), "b.txt".into()], 100);
        assert_eq!(describe_offer(&bundle), "2 item(s) starting with 'docs' (100 bytes zipped)");
    }
}
