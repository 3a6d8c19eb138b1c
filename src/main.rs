//! `futatabi`: multi-camera instant-replay server entry point. Parses
//! flags, builds a [`futatabi::context::CoreContext`], starts the HTTP
//! publisher's accept loop, and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use futatabi::config::Flags;
use futatabi::context::CoreContext;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn main() -> Result<()> {
    futatabi::logging::init();

    let flags = Flags::parse();
    flags.validate().map_err(anyhow::Error::msg).context("invalid flags")?;

    let context = CoreContext::new(flags.clone(), None).map_err(|e| anyhow::anyhow!(e)).context("failed to start core")?;

    if let Some(publisher) = context.publisher.clone() {
        let listener = TcpListener::bind(("0.0.0.0", flags.http_port)).with_context(|| format!("failed to bind port {}", flags.http_port))?;
        tracing::info!(port = flags.http_port, "listening for HTTP clients");
        std::thread::spawn(move || futatabi_publish::server::serve(listener, publisher));
    }

    let should_quit = Arc::new(AtomicBool::new(false));
    {
        let should_quit = should_quit.clone();
        ctrlc_handler(move || should_quit.store(true, Ordering::SeqCst))?;
    }

    while !should_quit.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    context.shutdown();
    Ok(())
}

/// Installs a SIGINT handler without pulling in the `ctrlc` crate, since
/// this is the only signal this binary cares about.
fn ctrlc_handler(callback: impl Fn() + Send + Sync + 'static) -> Result<()> {
    static HANDLER: std::sync::OnceLock<Box<dyn Fn() + Send + Sync>> = std::sync::OnceLock::new();
    HANDLER
        .set(Box::new(callback))
        .map_err(|_| anyhow::anyhow!("ctrlc_handler installed twice"))?;

    extern "C" fn on_sigint(_signum: i32) {
        if let Some(handler) = HANDLER.get() {
            handler();
        }
    }

    unsafe {
        libc::signal(libc::SIGINT, on_sigint as usize);
    }
    Ok(())
}
