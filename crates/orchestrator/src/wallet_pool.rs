//! The persisted wallet pool.
//!
//! Wallets are loaded once at boot and written back with a tmp-file +
//! rename so a crash never leaves a truncated pool on disk. Writes are
//! debounced through a dirty flag flushed at tick boundaries; the pool also
//! flushes on drop so every exit path persists.

use loom_crypto::KeyPair;
use loom_types::time::now_ms;
use loom_types::wallet::{WalletPoolFile, WalletRecord};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from wallet-pool persistence.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("wallet pool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wallet pool is malformed: {0}")]
    Malformed(String),
}

/// The wallet pool: persisted when a path is configured, in-memory otherwise.
pub struct WalletPool {
    path: Option<PathBuf>,
    wallets: Vec<WalletRecord>,
    dirty: bool,
}

impl WalletPool {
    /// Loads the pool from disk; a missing file starts an empty pool.
    pub fn load(path: Option<PathBuf>) -> Result<Self, PoolError> {
        let wallets = match &path {
            Some(p) if p.exists() => {
                let raw = fs::read(p)?;
                let file: WalletPoolFile = serde_json::from_slice(&raw)
                    .map_err(|e| PoolError::Malformed(e.to_string()))?;
                tracing::info!(target: "wallet_pool", count = file.wallets.len(), path = %p.display(), "wallet pool loaded");
                file.wallets
            }
            _ => Vec::new(),
        };
        Ok(Self {
            path,
            wallets,
            dirty: false,
        })
    }

    pub fn len(&self) -> usize {
        self.wallets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wallets.is_empty()
    }

    /// Draws a wallet that has never been registered on chain, if any.
    pub fn draw_unregistered(&self) -> Option<WalletRecord> {
        self.wallets
            .iter()
            .find(|w| w.agent_id.is_none())
            .cloned()
    }

    /// Adds a freshly generated key pair to the pool.
    pub fn add_generated(&mut self, keypair: &KeyPair, handle: String) -> WalletRecord {
        let record = WalletRecord {
            address: keypair.address().to_string(),
            public_key: keypair.public_hex(),
            private_key: keypair.private_hex(),
            platform: "generated".to_string(),
            handle,
            registered_at: None,
            agent_id: None,
        };
        self.wallets.push(record.clone());
        self.dirty = true;
        record
    }

    /// Backfills registration metadata after a successful `RegisterAgent`.
    pub fn mark_registered(&mut self, address: &str, fiber_id: &str) {
        if let Some(wallet) = self.wallets.iter_mut().find(|w| w.address == address) {
            wallet.registered_at = Some(now_ms());
            wallet.agent_id = Some(fiber_id.to_string());
            self.dirty = true;
        }
    }

    /// Writes the pool atomically when something changed since the last flush.
    pub fn flush_if_dirty(&mut self) -> Result<(), PoolError> {
        if !self.dirty {
            return Ok(());
        }
        let Some(path) = &self.path else {
            self.dirty = false;
            return Ok(());
        };
        let file = WalletPoolFile::new(self.wallets.clone());
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| PoolError::Malformed(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        self.dirty = false;
        tracing::debug!(target: "wallet_pool", count = file.count, path = %path.display(), "wallet pool flushed");
        Ok(())
    }
}

impl Drop for WalletPool {
    fn drop(&mut self) {
        if let Err(e) = self.flush_if_dirty() {
            tracing::error!(target: "wallet_pool", error = %e, "flush on drop failed");
        }
    }
}
