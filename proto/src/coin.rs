// Copyright (c) 2024-2025 The Keyfort Developers

//! Supported coins

use bitcoin::Network;
use strum::{Display, EnumIter, EnumString};

/// Coin identifier, selecting network parameters and the BIP-44 coin index
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum Coin {
    /// Bitcoin mainnet
    Btc,
    /// Bitcoin testnet
    Tbtc,
    /// Bitcoin regtest
    Rbtc,
}

impl Coin {
    /// Network parameters for address encoding
    pub fn network(&self) -> Network {
        match self {
            Coin::Btc => Network::Bitcoin,
            Coin::Tbtc => Network::Testnet,
            Coin::Rbtc => Network::Regtest,
        }
    }

    /// BIP-44 coin index expected in account keypaths
    pub fn bip44_index(&self) -> u32 {
        match self {
            Coin::Btc => 0,
            Coin::Tbtc | Coin::Rbtc => 1,
        }
    }
}
