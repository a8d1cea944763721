// Copyright (c) 2024-2025 The Keyfort Developers

//! Pairing channel state

use core::fmt::{self, Debug, Display};

use bitcoin::hashes::{sha256, Hash, HashEngine};

/// Channel hash binding a pairing session to its nonce exchange.
///
/// Both sides compute `SHA-256(host_nonce || device_nonce)` and show the
/// result for the user to compare. Equal hashes mean both ends saw the
/// same nonce exchange.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct ChannelHash([u8; 32]);

impl ChannelHash {
    /// Derive the channel hash from the session nonces
    pub fn derive(host_nonce: &[u8; 32], device_nonce: &[u8; 32]) -> Self {
        let mut engine = sha256::Hash::engine();
        engine.input(host_nonce);
        engine.input(device_nonce);

        Self(sha256::Hash::from_engine(engine).to_byte_array())
    }

    /// Fetch the raw hash bytes
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Display for ChannelHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Debug for ChannelHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChannelHash({})", self)
    }
}
