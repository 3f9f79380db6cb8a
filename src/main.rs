//! filedrop command-line entry point.
//!
//! - `filedrop serve [PORT]` accepts uploads into the upload directory
//! - `filedrop send <FILE> <HOST> <PORT>` uploads one file

use clap::Parser;
use filedrop::config::{CliArgs, Command, SendArgs, ServeArgs, ServerConfig};
use filedrop::{Sender, Server, TransferError};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    match cli.command {
        Command::Serve(args) => serve(args, &cli.log_level).await,
        Command::Send(args) => send(args, &cli.log_level).await,
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(args: ServeArgs, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load(&args, log_level)?;
    init_logging(&config.log_level);

    info!(
        address = %config.listen_addr(),
        upload_dir = %config.session.upload_dir.display(),
        workers = config.workers,
        "Starting filedrop server"
    );

    Server::new(config).run().await?;
    Ok(())
}

async fn send(args: SendArgs, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(log_level);

    let sender = Sender::new(args.chunk_size);
    match sender.send(&args.file, &args.host, args.port).await {
        Ok(outcome) if outcome.is_success() => println!("File transfer: Success"),
        Ok(outcome) => println!("File transfer: Failure ({:?})", outcome),
        // A missing input is a usage error and ends with a non-zero exit.
        Err(e @ TransferError::FileNotFound(_)) => return Err(e.into()),
        Err(e) => {
            error!(error = %e, "Client error");
            println!("File transfer: Failure");
        }
    }
    Ok(())
}
