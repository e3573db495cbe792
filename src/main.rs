//! kestrel server binary.
//!
//! Loads configuration, starts the networker, and drives the cycle
//! loop with a demo application layer that echoes every request's
//! payload and codec tag back to its sender.

use kestrel::config::Config;
use kestrel::{Codec, Networker};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.settings.host,
        port = config.settings.port,
        max_clients = config.settings.max_clients,
        "starting kestrel"
    );

    let mut net = Networker::new();
    net.start(&config.settings)?;

    loop {
        if let Err(e) = net.cycle() {
            error!(error = %e, "cycle failed");
            return Err(e.into());
        }

        // Answer everything that finished assembling since last cycle.
        while let Some((id, codec, payload)) = next_request(&net) {
            if net.claim(id).is_err() {
                break;
            }
            match net.apply_response(id, &payload, codec) {
                Ok(()) => debug!(id, bytes = payload.len(), "echoed request"),
                Err(e) => warn!(id, error = %e, "response rejected"),
            }
        }
    }
}

fn next_request(net: &Networker) -> Option<(u64, Codec, Vec<u8>)> {
    let slot = net.get_available()?;
    let codec = slot.codec().unwrap_or(Codec::None);
    Some((slot.id(), codec, slot.payload().to_vec()))
}
