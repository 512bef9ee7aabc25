pub mod envelope;
pub mod fingerprint;
pub mod port;
pub mod ring;
pub mod sab_ring;
pub mod sub_buffer;
pub mod telemetry;
pub mod types;
pub mod wire;

pub use fingerprint::fingerprint;
pub use port::Port;
pub use ring::SharedRing;
pub use sab_ring::SabRing;
pub use telemetry::*;

// Event signing/verification primitives, only with the 'crypto' feature
#[cfg(feature = "crypto")]
pub mod nostr_crypto;
