// Copyright (c) 2024-2025 The Keyfort Developers

//! Blockchain backend abstraction.
//!
//! The signing flow only needs two lookups from a backend: previous
//! transactions for amount verification, and the unspent outputs of an
//! account. Everything else (indexing, mempool state, broadcast) stays out
//! of this crate.

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};

use crate::builder::Utxo;

/// Wallet account identifier, opaque to this crate
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccountCode(pub String);

impl core::fmt::Display for AccountCode {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Blockchain backend errors
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// Transaction unknown to the backend
    #[error("Transaction {0} not found")]
    NotFound(Txid),

    /// Backend unreachable or misbehaving
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Blockchain queries needed by the signing flow
#[async_trait]
pub trait Blockchain: Send + Sync {
    /// Fetch a transaction by id
    async fn lookup_transaction(&self, txid: Txid) -> Result<Transaction, ChainError>;

    /// List spendable outputs of an account
    async fn list_unspent(&self, account: &AccountCode) -> Result<Vec<Utxo>, ChainError>;
}
