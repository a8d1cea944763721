// Copyright (c) 2024-2025 The Keyfort Developers

//! Account signing configurations and address derivation.
//!
//! A [`SigningConfig`] describes how an account's outputs are locked:
//! single signature under one of the simple script types, or threshold
//! multisig under P2WSH. Addresses derived from a configuration keep a
//! handle to it, so transaction inputs can later be resolved back to the
//! keys that control them.

use std::sync::Arc;

use bitcoin::bip32::{Fingerprint, Xpub};
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{self, Secp256k1, Verification};
use bitcoin::{Address, CompressedPublicKey, PublicKey, ScriptBuf};

use keyfort_proto::{AbsoluteKeypath, Coin, RelativeKeypath, ScriptConfig, ScriptType};

use crate::error::Error;

/// Maximum cosigners in a multisig configuration, bounded by standardness
/// rules for CHECKMULTISIG
pub const MULTISIG_MAX_KEYS: usize = 15;

/// One cosigner key of an account
#[derive(Clone, Debug, PartialEq)]
pub struct KeyInfo {
    /// Fingerprint of the master key this account key descends from
    pub root_fingerprint: Fingerprint,
    /// Account keypath below the master key
    pub keypath: AbsoluteKeypath,
    /// Extended public key at the account keypath
    pub xpub: Xpub,
}

/// Immutable signing configuration of an account.
///
/// Built once per account and shared via [`Arc`]. Cosigner order in a
/// multisig configuration is fixed at construction and determines the key
/// order in derived witness scripts.
#[derive(Clone, Debug)]
pub enum SigningConfig {
    /// Single signature account
    Simple {
        /// Output script type of the account
        script_type: ScriptType,
        /// The account key
        key: KeyInfo,
    },

    /// Threshold multisig account, P2WSH encoded
    Multisig {
        /// Signatures required to spend
        threshold: u32,
        /// Cosigner keys in configuration order
        keys: Vec<KeyInfo>,
        /// Index of the key controlled by the connected device
        our_key_index: u32,
    },
}

impl SigningConfig {
    /// Create a single signature configuration
    pub fn simple(script_type: ScriptType, key: KeyInfo) -> Result<Arc<Self>, Error> {
        // P2WSH needs cosigners, see [`SigningConfig::multisig`]
        if script_type == ScriptType::P2wsh {
            return Err(Error::InvalidConfiguration);
        }

        Ok(Arc::new(Self::Simple { script_type, key }))
    }

    /// Create a threshold multisig configuration
    pub fn multisig(
        threshold: u32,
        keys: Vec<KeyInfo>,
        our_key_index: u32,
    ) -> Result<Arc<Self>, Error> {
        let n = keys.len();

        if !(2..=MULTISIG_MAX_KEYS).contains(&n)
            || threshold == 0
            || threshold as usize > n
            || our_key_index as usize >= n
        {
            return Err(Error::InvalidConfiguration);
        }

        Ok(Arc::new(Self::Multisig {
            threshold,
            keys,
            our_key_index,
        }))
    }

    /// Output script type produced by this configuration
    pub fn script_type(&self) -> ScriptType {
        match self {
            Self::Simple { script_type, .. } => *script_type,
            Self::Multisig { .. } => ScriptType::P2wsh,
        }
    }

    /// Signatures needed to spend an output of this configuration
    pub fn signatures_required(&self) -> u32 {
        match self {
            Self::Simple { .. } => 1,
            Self::Multisig { threshold, .. } => *threshold,
        }
    }

    /// The key controlled by the connected device
    pub fn our_key(&self) -> &KeyInfo {
        match self {
            Self::Simple { key, .. } => key,
            Self::Multisig {
                keys,
                our_key_index,
                ..
            } => &keys[*our_key_index as usize],
        }
    }

    /// Account keypath of the device key
    pub fn account_keypath(&self) -> &AbsoluteKeypath {
        &self.our_key().keypath
    }

    /// Master fingerprint of the device key
    pub fn root_fingerprint(&self) -> Fingerprint {
        self.our_key().root_fingerprint
    }

    /// Wire form sent to the device
    pub(crate) fn to_proto(&self) -> ScriptConfig {
        match self {
            Self::Simple { script_type, .. } => ScriptConfig::Simple {
                script_type: *script_type,
            },
            Self::Multisig {
                threshold,
                keys,
                our_key_index,
            } => ScriptConfig::Multisig {
                threshold: *threshold,
                xpubs: keys.iter().map(|k| k.xpub).collect(),
                our_xpub_index: *our_key_index,
            },
        }
    }

    /// Derive the address at `relative` under this configuration
    pub fn derive_address<C: Verification>(
        self: &Arc<Self>,
        secp: &Secp256k1<C>,
        coin: Coin,
        relative: RelativeKeypath,
    ) -> Result<AccountAddress, Error> {
        let network = coin.network();

        match self.as_ref() {
            Self::Simple { script_type, key } => {
                let child = key.xpub.derive_pub(secp, &relative.children())?;
                let compressed = CompressedPublicKey(child.public_key);

                let (script_pubkey, address) = match script_type {
                    ScriptType::P2pkh => {
                        let pk = PublicKey::new(child.public_key);
                        (
                            ScriptBuf::new_p2pkh(&pk.pubkey_hash()),
                            Address::p2pkh(&pk, network),
                        )
                    }
                    ScriptType::P2wpkh => (
                        ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
                        Address::p2wpkh(&compressed, network),
                    ),
                    ScriptType::P2wpkhP2sh => {
                        let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
                        (redeem.to_p2sh(), Address::p2shwpkh(&compressed, network))
                    }
                    ScriptType::P2tr => {
                        let (xonly, _) = child.public_key.x_only_public_key();
                        (
                            ScriptBuf::new_p2tr(secp, xonly, None),
                            Address::p2tr(secp, xonly, None, network),
                        )
                    }
                    ScriptType::P2wsh => return Err(Error::InvalidConfiguration),
                };

                Ok(AccountAddress {
                    config: self.clone(),
                    relative,
                    pubkey: child.public_key,
                    witness_script: None,
                    script_pubkey,
                    address,
                })
            }

            Self::Multisig {
                threshold,
                keys,
                our_key_index,
            } => {
                let mut pubkeys = Vec::with_capacity(keys.len());
                for k in keys {
                    let child = k.xpub.derive_pub(secp, &relative.children())?;
                    pubkeys.push(child.public_key);
                }

                let witness_script = multisig_script(*threshold, &pubkeys);
                let script_pubkey = witness_script.to_p2wsh();
                let address = Address::p2wsh(&witness_script, network);

                Ok(AccountAddress {
                    config: self.clone(),
                    relative,
                    pubkey: pubkeys[*our_key_index as usize],
                    witness_script: Some(witness_script),
                    script_pubkey,
                    address,
                })
            }
        }
    }
}

/// Build the `k` of `n` CHECKMULTISIG witness script over `pubkeys` in
/// configuration order
fn multisig_script(threshold: u32, pubkeys: &[secp256k1::PublicKey]) -> ScriptBuf {
    let mut b = Builder::new().push_int(threshold as i64);

    for pk in pubkeys {
        b = b.push_slice(pk.serialize());
    }

    b.push_int(pubkeys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

/// Address derived under a signing configuration.
///
/// Carries the configuration handle and relative keypath it was derived
/// from, so inputs funding this address resolve back to their signing keys
/// without a database lookup.
#[derive(Clone, Debug)]
pub struct AccountAddress {
    config: Arc<SigningConfig>,
    relative: RelativeKeypath,
    pubkey: secp256k1::PublicKey,
    witness_script: Option<ScriptBuf>,
    script_pubkey: ScriptBuf,
    address: Address,
}

impl AccountAddress {
    /// Configuration this address was derived under
    pub fn config(&self) -> &Arc<SigningConfig> {
        &self.config
    }

    /// Keypath below the account key
    pub fn relative(&self) -> RelativeKeypath {
        self.relative
    }

    /// Full keypath below the master key
    pub fn keypath(&self) -> AbsoluteKeypath {
        self.config.account_keypath().join(&self.relative)
    }

    /// Derived public key of the device at this address
    pub fn pubkey(&self) -> &secp256k1::PublicKey {
        &self.pubkey
    }

    /// Witness script for multisig addresses
    pub fn witness_script(&self) -> Option<&ScriptBuf> {
        self.witness_script.as_ref()
    }

    /// Output script paying this address
    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    /// Encoded address
    pub fn address(&self) -> &Address {
        &self.address
    }
}
