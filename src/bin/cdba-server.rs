//! cdba-server entry point (the board-side half).
//!
//! Spawned by the client over ssh. Stdout is the framed channel, so all
//! diagnostics go to stderr.

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use cdba::server::{Registry, Server};

#[derive(Parser, Debug)]
#[command(name = "cdba-server", version, about = "Board-side server for cdba")]
struct Args {
    /// Board file to use instead of ./.cdba or /etc/cdba
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let registry = match &args.config {
        Some(path) => Registry::load_from(path),
        None => Registry::load(),
    };
    let registry = match registry {
        Ok(registry) => registry,
        Err(err) => {
            eprintln!("cdba-server: {err}");
            process::exit(1);
        }
    };
    tracing::info!(user = registry.user(), "serving");

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("cdba-server: {err}");
            process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        Server::new(registry, tokio::io::stdin(), tokio::io::stdout())
            .run()
            .await
    });

    if let Err(err) = result {
        eprintln!("cdba-server: {err}");
        process::exit(1);
    }
}
