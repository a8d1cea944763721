// Copyright (c) 2024-2025 The Keyfort Developers

//! Device key material and the keypath policy.
//!
//! The device only derives keys at keypaths matching the policy enforced
//! here: simple accounts at `m/purpose'/coin'/account'` where the purpose
//! matches the script type, multisig accounts at `m/48'/coin'/account'/2'`,
//! and addresses two unhardened steps below an account.

use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{Secp256k1, Signing};
use bitcoin::NetworkKind;
use zeroize::Zeroize;

use keyfort_proto::{AbsoluteKeypath, Coin, ScriptType};

use crate::SimError;

/// Highest hardened account index the device will derive
const MAX_ACCOUNT: u32 = 100;

/// Highest address index the device will derive
const MAX_ADDRESS_INDEX: u32 = 10_000;

/// Script type component of multisig account keypaths, `2'` selecting P2WSH
const MULTISIG_SCRIPT_P2WSH: u32 = 2;

/// Seed derived key material held by the device
pub(crate) struct DeviceKeys {
    master: Xpriv,
}

impl DeviceKeys {
    /// Restore keys from a BIP-39 recovery phrase with an empty passphrase
    pub fn from_mnemonic(phrase: &str) -> Result<Self, SimError> {
        let mnemonic = bip39::Mnemonic::parse(phrase)?;
        let mut seed = mnemonic.to_seed("");

        // Mainnet key version bytes whatever the coin; xpubs are reported
        // the same way
        let master = Xpriv::new_master(NetworkKind::Main, &seed)?;
        seed.zeroize();

        Ok(Self { master })
    }

    pub fn root_fingerprint<C: Signing>(&self, secp: &Secp256k1<C>) -> Fingerprint {
        self.master.fingerprint(secp)
    }

    /// Derive the private key at a full keypath
    pub fn derive<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        keypath: &AbsoluteKeypath,
    ) -> Result<Xpriv, SimError> {
        Ok(self.master.derive_priv(secp, keypath.path())?)
    }

    /// Derive the extended public key at an account keypath
    pub fn account_xpub<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        keypath: &AbsoluteKeypath,
    ) -> Result<Xpub, SimError> {
        let xpriv = self.derive(secp, keypath)?;
        Ok(Xpub::from_priv(secp, &xpriv))
    }
}

/// Check an account level keypath against the derivation policy for `coin`
pub(crate) fn is_account_keypath(keypath: &AbsoluteKeypath, coin: Coin) -> bool {
    match *keypath.components() {
        [ChildNumber::Hardened { index: purpose }, ChildNumber::Hardened { index: coin_index }, ChildNumber::Hardened { index: account }] => {
            matches!(purpose, 44 | 49 | 84 | 86)
                && coin_index == coin.bip44_index()
                && account < MAX_ACCOUNT
        }
        [ChildNumber::Hardened { index: 48 }, ChildNumber::Hardened { index: coin_index }, ChildNumber::Hardened { index: account }, ChildNumber::Hardened { index: script }] => {
            script == MULTISIG_SCRIPT_P2WSH
                && coin_index == coin.bip44_index()
                && account < MAX_ACCOUNT
        }
        _ => false,
    }
}

/// Split a full address keypath into its account prefix, branch and index.
///
/// Returns `None` when any part of the path violates the policy, including
/// a purpose component that does not match `script_type`.
pub(crate) fn split_address_keypath(
    keypath: &AbsoluteKeypath,
    coin: Coin,
    script_type: ScriptType,
) -> Option<(AbsoluteKeypath, u32, u32)> {
    let components = keypath.components();
    let account_len = match script_type {
        ScriptType::P2wsh => 4,
        _ => 3,
    };
    if components.len() != account_len + 2 {
        return None;
    }

    let (branch, index) = match components[account_len..] {
        [ChildNumber::Normal { index: branch }, ChildNumber::Normal { index }] => (branch, index),
        _ => return None,
    };
    if branch > 1 || index >= MAX_ADDRESS_INDEX {
        return None;
    }

    match components[0] {
        ChildNumber::Hardened { index } if index == script_type.bip44_purpose() => {}
        _ => return None,
    }

    let prefix = AbsoluteKeypath::from(DerivationPath::from(components[..account_len].to_vec()));
    if !is_account_keypath(&prefix, coin) {
        return None;
    }

    Some((prefix, branch, index))
}
