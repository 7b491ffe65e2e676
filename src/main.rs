mod cli;
mod engine;
mod error;
mod ipc;
mod locate;
mod metrics;
mod model;
mod orchestrator;
mod state;
mod text_summary;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so stdout stays free for events and the summary.
fn init_tracing(silent: bool) {
    let default = if silent { "error" } else { "imapsync_runner=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    let is_silent = args.silent;
    init_tracing(is_silent);

    // Exit explicitly: a pending stdin read in serve mode would otherwise hold the runtime open.
    match cli::run(args).await {
        Ok(true) => std::process::exit(0),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            if is_silent {
                println!("{}", e);
            } else {
                eprintln!("Error: {:#}", e);
            }
            std::process::exit(2);
        }
    }
}
