//! The nameserver daemon.
//!
//! Serves `/oper/ns` requests on the configured port, feeding from the
//! address receiver.  Ctrl-C shuts it down cleanly with exit code 0.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use clap::Parser;
use posttroll::ns::NameServer;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(about = "Translate service names into publisher addresses")]
struct Args {
    /// File to log to (defaults to stdout)
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Print debug messages too
    #[arg(short, long)]
    verbose: bool,

    /// Disable multicasting
    #[arg(long)]
    no_multicast: bool,

    /// Accept connections only from localhost
    #[arg(short = 'L', long)]
    local_only: bool,
}

fn init_logging(args: &Args) {
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    match &args.log {
        Some(path) => {
            let file = File::create(path).unwrap_or_else(|e| {
                eprintln!("FATAL: cannot open log file '{}': {e}", path.display());
                std::process::exit(1);
            });
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    let ns = NameServer::new(None, !args.no_multicast, args.local_only);
    let stopper = ns.clone();
    let mut worker = tokio::task::spawn_blocking(move || ns.run(None));

    let result = tokio::select! {
        joined = &mut worker => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            stopper.stop();
            worker.await
        }
    };

    match result {
        Ok(Ok(())) => {
            println!("Thanks for using the nameserver. See you soon!");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            tracing::error!("nameserver failed: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("nameserver worker panicked: {e}");
            ExitCode::FAILURE
        }
    }
}
