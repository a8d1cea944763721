// Copyright (c) 2024-2025 The Keyfort Developers

//! Script types and signing configurations

use bitcoin::bip32::Xpub;
use strum::{Display, EnumIter, EnumString};

/// Output script types the signer understands
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
pub enum ScriptType {
    /// Legacy pay-to-pubkey-hash
    #[strum(serialize = "p2pkh")]
    P2pkh,

    /// Native segwit v0 pay-to-witness-pubkey-hash
    #[strum(serialize = "p2wpkh")]
    P2wpkh,

    /// Segwit v0 pay-to-witness-pubkey-hash nested in P2SH
    #[strum(serialize = "p2wpkh-p2sh")]
    P2wpkhP2sh,

    /// Taproot key spend
    #[strum(serialize = "p2tr")]
    P2tr,

    /// Segwit v0 pay-to-witness-script-hash multisig
    #[strum(serialize = "p2wsh")]
    P2wsh,
}

impl ScriptType {
    /// Sighash algorithm family used when spending this script type
    pub fn sighash_family(&self) -> SighashFamily {
        match self {
            ScriptType::P2pkh => SighashFamily::Legacy,
            ScriptType::P2wpkh | ScriptType::P2wpkhP2sh | ScriptType::P2wsh => {
                SighashFamily::SegwitV0
            }
            ScriptType::P2tr => SighashFamily::Taproot,
        }
    }

    /// BIP-44 purpose field expected in account keypaths
    pub fn bip44_purpose(&self) -> u32 {
        match self {
            ScriptType::P2pkh => 44,
            ScriptType::P2wpkhP2sh => 49,
            ScriptType::P2wpkh => 84,
            ScriptType::P2tr => 86,
            ScriptType::P2wsh => 48,
        }
    }
}

/// Sighash algorithm families
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum SighashFamily {
    /// Original signature hash, commits to the spent script only
    Legacy,
    /// BIP-143 signature hash, commits to the spent amount
    SegwitV0,
    /// BIP-341 signature hash, commits to every spent output
    Taproot,
}

impl SighashFamily {
    /// Whether inputs of this family need the full previous transaction
    /// streamed to the device for amount verification
    pub fn requires_previous_transaction(&self) -> bool {
        !matches!(self, SighashFamily::Taproot)
    }
}

/// Wire form of a signing configuration.
///
/// Transaction inputs and internal outputs reference one of these by index,
/// letting a single request mix script types.
#[derive(Clone, Debug, PartialEq)]
pub enum ScriptConfig {
    /// Single signature account
    Simple {
        /// Output script type of the account
        script_type: ScriptType,
    },

    /// Threshold multisig account, P2WSH encoded
    Multisig {
        /// Signatures required to spend
        threshold: u32,
        /// Cosigner account keys, in fixed configuration order
        xpubs: Vec<Xpub>,
        /// Index of the device key within `xpubs`
        our_xpub_index: u32,
    },
}

impl ScriptConfig {
    /// Output script type produced by this configuration
    pub fn script_type(&self) -> ScriptType {
        match self {
            ScriptConfig::Simple { script_type } => *script_type,
            ScriptConfig::Multisig { .. } => ScriptType::P2wsh,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn families() {
        assert_eq!(ScriptType::P2pkh.sighash_family(), SighashFamily::Legacy);
        assert_eq!(ScriptType::P2wpkh.sighash_family(), SighashFamily::SegwitV0);
        assert_eq!(
            ScriptType::P2wpkhP2sh.sighash_family(),
            SighashFamily::SegwitV0
        );
        assert_eq!(ScriptType::P2wsh.sighash_family(), SighashFamily::SegwitV0);
        assert_eq!(ScriptType::P2tr.sighash_family(), SighashFamily::Taproot);
    }

    #[test]
    fn previous_transaction_requirement() {
        for t in ScriptType::iter() {
            let required = t.sighash_family().requires_previous_transaction();
            assert_eq!(required, t != ScriptType::P2tr, "{}", t);
        }
    }

    #[test]
    fn name_round_trip() {
        for t in ScriptType::iter() {
            assert_eq!(t.to_string().parse::<ScriptType>(), Ok(t));
        }
        assert_eq!("p2wpkh-p2sh".parse(), Ok(ScriptType::P2wpkhP2sh));
    }
}
