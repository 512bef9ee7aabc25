/// Connection parameters for a NIP-46 remote signer session.
#[derive(Debug, Clone)]
pub struct Nip46Config {
    /// Hex pubkey of the remote signer; empty in QR mode until discovery.
    pub remote_signer_pubkey: String,
    pub relays: Vec<String>,
    pub app_name: Option<String>,
    /// Connection secret: required in QR mode, optional for bunker URLs.
    pub expected_secret: Option<String>,
}
