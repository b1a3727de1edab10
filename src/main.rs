use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use codedrop::Config;

#[derive(Parser)]
#[command(name = "codedrop")]
#[command(about = "Send files and messages with a short one-time code", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Mailbox broker address (overrides CODEDROP_BROKER)
    #[arg(long, global = true)]
    broker: Option<String>,

    /// Transit relay address, empty to disable (overrides CODEDROP_RELAY)
    #[arg(long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send files, folders or a text message
    Send {
        /// Paths to send; several paths or a folder travel as one bundle
        paths: Vec<String>,
        /// Send this text instead of files
        #[arg(long)]
        text: Option<String>,
    },
    /// Receive with a code
    Receive {
        /// Code from the sender (will prompt if not provided)
        code: Option<String>,
        /// Directory to write received files to (default: current directory)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
        /// Accept the offer without asking
        #[arg(long)]
        accept: bool,
    },
    /// Run as a transit relay server
    Relay {
        /// Port to bind to
        #[arg(short, long, default_value = "4001")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = Config::from_env()?;
    if let Some(broker) = cli.broker {
        config.broker_addr = broker;
    }
    if let Some(relay) = cli.relay {
        config.relay_addr = (!relay.is_empty()).then_some(relay);
    }

    let outcome = match cli.command {
        Commands::Send { paths, text } => codedrop::commands::send::run(paths, text, config).await,
        Commands::Receive { code, output_dir, accept } => {
            codedrop::commands::receive::run(code, output_dir, accept, config).await
        }
        Commands::Relay { port } => codedrop::commands::relay::run(port).await,
    };

    // Exit here rather than returning: dropping the runtime would wait for a
    // confirmation prompt still blocked on stdin after a cancel.
    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    Ok(())
}
