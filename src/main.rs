use clap::Parser;
use std::panic::{self, PanicHookInfo};
use thermobeacon_exporter::app::{self, Options, RealScanner};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("thermobeacon_exporter={level},warn")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received interrupt, exiting"),
        Err(e) => {
            // Without a signal handler the process can only be killed
            warn!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match app::run(options, &RealScanner, shutdown_signal()).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
