mod arch;
mod cache;
mod cli;
mod file;
mod handlers;
mod messages;
mod optimistic;
mod paths;
mod resolver;
mod scanner;
mod transcode;
mod watch;

use crate::cli::process_cli_arguments;
use std::env;

/// Custom hook on panics (copied from Deno).
fn setup_panic_hook() {
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        eprintln!("\n============================================================");
        eprintln!("Modscan has panicked. This is a bug in Modscan. Please report");
        eprintln!("this with the reproduction steps and re-run with the");
        eprintln!("RUST_BACKTRACE=1 env var set to include the backtrace in");
        eprintln!("your report.");
        eprintln!();
        eprintln!("Platform: {} {}", env::consts::OS, env::consts::ARCH);
        eprintln!("Version: {}", env!("CARGO_PKG_VERSION"));
        eprintln!("Args: {:?}", env::args().collect::<Vec<_>>());
        eprintln!();
        orig_hook(panic_info);
        std::process::exit(1);
    }));
}

fn main() {
    // Set custom panic hook on release builds.
    if !cfg!(debug_assertions) {
        setup_panic_hook();
    }

    process_cli_arguments();
}
