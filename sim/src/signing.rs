// Copyright (c) 2024-2025 The Keyfort Developers

//! Device side transaction checking and signing.
//!
//! Every input and internal output keypath is checked against the derivation
//! policy and re-derived from the device seed before anything is shown to
//! the user. Inputs whose sighash commits only to a claimed amount are
//! verified against the full previous transaction supplied in the request.

use bitcoin::bip32::ChildNumber;
use bitcoin::hashes::Hash;
use bitcoin::key::TapTweak;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{self, Keypair, Message, Secp256k1, SecretKey, Signing, Verification};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    Address, Amount, CompressedPublicKey, PublicKey, Script, ScriptBuf, Transaction, TxIn, TxOut,
    Witness,
};

use keyfort_proto::{
    AbsoluteKeypath, Coin, DeviceErrorCode, InputSignature, OutputPayload, ScriptConfig,
    ScriptType, SighashFamily, SignRequest, TxInputDescriptor,
};

use crate::keys::{self, DeviceKeys};

/// Largest cosigner set accepted in a multisig configuration
const MULTISIG_MAX_KEYS: usize = 15;

/// Everything the device derives for one input
struct SpendInfo {
    family: SighashFamily,
    script_pubkey: ScriptBuf,
    script_code: ScriptBuf,
    value: Amount,
    sk: SecretKey,
}

/// A signing request that passed every check and is ready for user review
pub(crate) struct ValidatedRequest {
    tx: Transaction,
    spends: Vec<SpendInfo>,
    /// Lines shown on the device screen during review
    pub review: Vec<String>,
}

struct DerivedSpend {
    address: Address,
    script_pubkey: ScriptBuf,
    script_code: ScriptBuf,
    sk: SecretKey,
}

/// Derive the address a configuration and keypath stand for
pub(crate) fn derive_address<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    keys: &DeviceKeys,
    coin: Coin,
    config: &ScriptConfig,
    keypath: &AbsoluteKeypath,
) -> Result<Address, DeviceErrorCode> {
    Ok(derive_spend(secp, keys, coin, config, keypath)?.address)
}

fn derive_spend<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    keys: &DeviceKeys,
    coin: Coin,
    config: &ScriptConfig,
    keypath: &AbsoluteKeypath,
) -> Result<DerivedSpend, DeviceErrorCode> {
    let script_type = config.script_type();
    let (prefix, branch, index) = keys::split_address_keypath(keypath, coin, script_type)
        .ok_or(DeviceErrorCode::InvalidKeypath)?;

    let network = coin.network();
    let child = keys
        .derive(secp, keypath)
        .map_err(|_| DeviceErrorCode::InvalidKeypath)?;
    let pubkey = child.private_key.public_key(secp);

    match config {
        ScriptConfig::Simple { script_type } => {
            let compressed = CompressedPublicKey(pubkey);
            let (script_pubkey, script_code, address) = match script_type {
                ScriptType::P2pkh => {
                    let pk = PublicKey::new(pubkey);
                    let spk = ScriptBuf::new_p2pkh(&pk.pubkey_hash());
                    (spk.clone(), spk, Address::p2pkh(&pk, network))
                }
                ScriptType::P2wpkh => {
                    let spk = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
                    (spk.clone(), spk, Address::p2wpkh(&compressed, network))
                }
                ScriptType::P2wpkhP2sh => {
                    let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
                    (
                        redeem.to_p2sh(),
                        redeem,
                        Address::p2shwpkh(&compressed, network),
                    )
                }
                ScriptType::P2tr => {
                    let (xonly, _) = pubkey.x_only_public_key();
                    (
                        ScriptBuf::new_p2tr(secp, xonly, None),
                        ScriptBuf::new(),
                        Address::p2tr(secp, xonly, None, network),
                    )
                }
                // A simple configuration cannot carry a threshold script
                ScriptType::P2wsh => return Err(DeviceErrorCode::BadRequest),
            };

            Ok(DerivedSpend {
                address,
                script_pubkey,
                script_code,
                sk: child.private_key,
            })
        }

        ScriptConfig::Multisig {
            threshold,
            xpubs,
            our_xpub_index,
        } => {
            let n = xpubs.len();
            if !(2..=MULTISIG_MAX_KEYS).contains(&n)
                || *threshold == 0
                || *threshold as usize > n
            {
                return Err(DeviceErrorCode::BadRequest);
            }

            // The cosigner slot claimed as ours must hold our account key
            let ours = keys
                .account_xpub(secp, &prefix)
                .map_err(|_| DeviceErrorCode::InvalidKeypath)?;
            if xpubs.get(*our_xpub_index as usize) != Some(&ours) {
                return Err(DeviceErrorCode::BadRequest);
            }

            let steps = [
                ChildNumber::Normal { index: branch },
                ChildNumber::Normal { index },
            ];
            let mut pubkeys = Vec::with_capacity(n);
            for xpub in xpubs {
                let cosigner = xpub
                    .derive_pub(secp, &steps)
                    .map_err(|_| DeviceErrorCode::BadRequest)?;
                pubkeys.push(cosigner.public_key);
            }

            let witness_script = multisig_script(*threshold, &pubkeys);
            let script_pubkey = witness_script.to_p2wsh();
            let address = Address::p2wsh(&witness_script, network);

            Ok(DerivedSpend {
                address,
                script_pubkey,
                script_code: witness_script,
                sk: child.private_key,
            })
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

/// Check a signing request and assemble the transaction it describes.
///
/// The returned request carries the review lines for the approval screen;
/// nothing is signed until the user accepts them.
pub(crate) fn validate_request<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    keys: &DeviceKeys,
    req: &SignRequest,
) -> Result<ValidatedRequest, DeviceErrorCode> {
    if req.script_configs.is_empty() || req.inputs.is_empty() || req.outputs.is_empty() {
        return Err(DeviceErrorCode::BadRequest);
    }

    let mut spends = Vec::with_capacity(req.inputs.len());
    let mut txins = Vec::with_capacity(req.inputs.len());

    for input in &req.inputs {
        let config = req
            .script_configs
            .get(input.config_index as usize)
            .ok_or(DeviceErrorCode::BadRequest)?;

        let spend = derive_spend(secp, keys, req.coin, config, &input.keypath)?;

        let family = config.script_type().sighash_family();
        if family.requires_previous_transaction() {
            verify_previous_transaction(req, input, &spend.script_pubkey)?;
        }

        txins.push(TxIn {
            previous_output: input.outpoint,
            script_sig: ScriptBuf::new(),
            sequence: input.sequence,
            witness: Witness::new(),
        });
        spends.push(SpendInfo {
            family,
            script_pubkey: spend.script_pubkey,
            script_code: spend.script_code,
            value: input.value,
            sk: spend.sk,
        });
    }

    let mut review = Vec::new();
    let mut txouts = Vec::with_capacity(req.outputs.len());

    for output in &req.outputs {
        let script_pubkey = match &output.payload {
            OutputPayload::External(script) => {
                if script.is_empty() {
                    return Err(DeviceErrorCode::BadRequest);
                }
                review.push(format!(
                    "Send {} sat to {}",
                    output.value.to_sat(),
                    display_script(req.coin, script)
                ));
                script.clone()
            }

            OutputPayload::Internal {
                config_index,
                keypath,
            } => {
                let config = req
                    .script_configs
                    .get(*config_index as usize)
                    .ok_or(DeviceErrorCode::BadRequest)?;

                // Internal outputs must pay the change chain of our own
                // account, anything else is shown to the user instead
                let (_, branch, _) =
                    keys::split_address_keypath(keypath, req.coin, config.script_type())
                        .ok_or(DeviceErrorCode::InvalidKeypath)?;
                if branch != 1 {
                    return Err(DeviceErrorCode::InvalidKeypath);
                }

                derive_spend(secp, keys, req.coin, config, keypath)?.script_pubkey
            }
        };

        txouts.push(TxOut {
            value: output.value,
            script_pubkey,
        });
    }

    let input_value = req
        .inputs
        .iter()
        .map(|i| i.value.to_sat())
        .fold(0u64, u64::saturating_add);
    let output_value = req
        .outputs
        .iter()
        .map(|o| o.value.to_sat())
        .fold(0u64, u64::saturating_add);
    if output_value > input_value {
        return Err(DeviceErrorCode::BadRequest);
    }
    review.push(format!("Fee {} sat", input_value - output_value));

    let tx = Transaction {
        version: req.version,
        lock_time: req.lock_time,
        input: txins,
        output: txouts,
    };

    Ok(ValidatedRequest { tx, spends, review })
}

/// Check a claimed previous output against the full transaction in the
/// request
fn verify_previous_transaction(
    req: &SignRequest,
    input: &TxInputDescriptor,
    script_pubkey: &Script,
) -> Result<(), DeviceErrorCode> {
    let prev = req
        .prev_txs
        .iter()
        .find(|tx| tx.compute_txid() == input.outpoint.txid)
        .ok_or(DeviceErrorCode::PreviousTransactionMismatch)?;

    let prevout = prev
        .output
        .get(input.outpoint.vout as usize)
        .ok_or(DeviceErrorCode::PreviousTransactionMismatch)?;

    if prevout.value != input.value || *prevout.script_pubkey != *script_pubkey {
        return Err(DeviceErrorCode::PreviousTransactionMismatch);
    }

    Ok(())
}

fn display_script(coin: Coin, script: &Script) -> String {
    match Address::from_script(script, coin.network()) {
        Ok(address) => address.to_string(),
        Err(_) => script.to_hex_string(),
    }
}

/// Produce one signature per input of an approved request
pub(crate) fn sign_validated<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    validated: &ValidatedRequest,
) -> Result<Vec<InputSignature>, DeviceErrorCode> {
    let spent: Vec<TxOut> = validated
        .spends
        .iter()
        .map(|s| TxOut {
            value: s.value,
            script_pubkey: s.script_pubkey.clone(),
        })
        .collect();

    let mut cache = SighashCache::new(&validated.tx);
    let mut signatures = Vec::with_capacity(validated.spends.len());

    for (i, spend) in validated.spends.iter().enumerate() {
        let signature = match spend.family {
            SighashFamily::Legacy => {
                let sighash = cache
                    .legacy_signature_hash(i, &spend.script_code, EcdsaSighashType::All.to_u32())
                    .map_err(|_| DeviceErrorCode::BadRequest)?;
                let msg = Message::from_digest(sighash.to_byte_array());
                InputSignature::Ecdsa(secp.sign_ecdsa_low_r(&msg, &spend.sk))
            }

            SighashFamily::SegwitV0 => {
                let sighash = if spend.script_code.is_p2wpkh() {
                    cache
                        .p2wpkh_signature_hash(
                            i,
                            &spend.script_code,
                            spend.value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|_| DeviceErrorCode::BadRequest)?
                } else {
                    cache
                        .p2wsh_signature_hash(
                            i,
                            &spend.script_code,
                            spend.value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|_| DeviceErrorCode::BadRequest)?
                };
                let msg = Message::from_digest(sighash.to_byte_array());
                InputSignature::Ecdsa(secp.sign_ecdsa_low_r(&msg, &spend.sk))
            }

            SighashFamily::Taproot => {
                let sighash = cache
                    .taproot_key_spend_signature_hash(
                        i,
                        &Prevouts::All(&spent),
                        TapSighashType::Default,
                    )
                    .map_err(|_| DeviceErrorCode::BadRequest)?;
                let msg = Message::from_digest(sighash.to_byte_array());

                let keypair = Keypair::from_secret_key(secp, &spend.sk);
                let tweaked = keypair.tap_tweak(secp, None).to_keypair();
                InputSignature::Schnorr(secp.sign_schnorr_no_aux_rand(&msg, &tweaked))
            }
        };

        signatures.push(signature);
    }

    Ok(signatures)
}
