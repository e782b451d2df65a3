//! Tracing setup for embedding shells
//!
//! The core only emits `tracing` events; installing a subscriber is the
//! surrounding shell's job. This helper wires up the standard formatter with
//! an environment-driven filter for shells that do not bring their own.

use tracing_subscriber::EnvFilter;

/// Installs the default `tracing` subscriber
///
/// The filter honors `RUST_LOG` and defaults to `switchyard=info`. Calling
/// this more than once (or after the shell installed its own subscriber) is
/// harmless: the later call is ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("switchyard=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
    }
}
