//! The main entrypoint for bootslot, which just performs global initialization,
//! and then calls out into the library.
use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

/// The code called after we've done process global init and created
/// an async runtime.
async fn async_main() -> Result<()> {
    bootslot_utils::initialize_tracing();

    tracing::trace!("starting bootslot");

    bootslot_lib::cli::run_from_iter(std::env::args()).await
}

/// Create an async runtime and do the rest of the work there.
fn run() -> Result<()> {
    // We only use the current thread runtime; blocking work is moved to
    // the blocking pool explicitly.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move { async_main().await })
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
