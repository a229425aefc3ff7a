//! stepd: a single-threaded event-driven application server core.
//!
//! One reactor multiplexes many client connections, decodes
//! length-framed binary and HTTP messages, and executes request handlers
//! as explicit resumable step machines that may suspend while waiting on
//! external asynchronous operations.

mod codec;
mod config;
mod reactor;
mod router;

use config::Config;
use reactor::Dispatcher;
use router::EchoRouter;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        codec = ?config.codec_kind(),
        keep_alive_secs = config.keep_alive_secs,
        cmd_timeout_ms = config.cmd_timeout_ms,
        "Starting stepd"
    );

    let mut dispatcher = Dispatcher::new(config, Box::new(EchoRouter::new()))?;
    dispatcher.listen()?;
    dispatcher.run()?;
    Ok(())
}
