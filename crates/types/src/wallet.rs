//! The persisted wallet-pool file format.

use serde::{Deserialize, Serialize};

/// One persisted wallet.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    /// Derived address.
    pub address: String,
    /// Uncompressed public key hex (no `04` prefix).
    pub public_key: String,
    /// 32-byte secret scalar, hex.
    pub private_key: String,
    /// Originating platform label.
    pub platform: String,
    /// Platform handle or display name.
    pub handle: String,
    /// Millisecond epoch of successful on-chain registration, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<u64>,
    /// Identity fiber id, once registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// The wallet-pool file: `{ count, wallets: [...] }`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct WalletPoolFile {
    /// Number of wallets; kept consistent with `wallets.len()` on write.
    pub count: usize,
    /// The wallets themselves.
    pub wallets: Vec<WalletRecord>,
}

impl WalletPoolFile {
    /// Wraps a wallet list, fixing up `count`.
    pub fn new(wallets: Vec<WalletRecord>) -> Self {
        Self {
            count: wallets.len(),
            wallets,
        }
    }
}
