/*!
Signer backends behind a uniform op surface:

- `pk`    : local private-key signer (Schnorr, NIP-44)
- `nip07` : browser extension via the main-thread escape hatch
- `nip46` : remote signer over relays (Nostr Connect)

Each backend exposes a minimal browser-friendly async API without
async_trait; the worker loop in `lib.rs` dispatches ops onto whichever
backend is active.
*/

pub mod nip07;
pub mod nip46;
pub mod pk;

pub use nip07::{ExtensionBridge, Nip07Signer};
pub use nip46::{Nip46Config, Nip46Signer};
pub use pk::PrivateKeySigner;

/// Error type shared by the signer backends.
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("no signer available")]
    NoSigner,

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("operation not supported by this signer: {0}")]
    Unsupported(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("extension error: {0}")]
    Extension(String),

    #[error("remote signer error: {0}")]
    Remote(String),

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

pub type SignerResult<T> = Result<T, SignerError>;
