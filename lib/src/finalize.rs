// Copyright (c) 2024-2025 The Keyfort Developers

//! Transaction finalization.
//!
//! Turns a fully signed proposal into a broadcastable transaction by
//! encoding each collected signature into the script or witness form its
//! input's script type dictates. Finalization is pure: the proposal is
//! only read, so it can be retried after a partial signing run completes.

use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::sighash::{EcdsaSighashType, TapSighashType};
use bitcoin::{ecdsa, taproot, CompressedPublicKey, Transaction, Witness};

use keyfort_proto::{InputSignature, ScriptType};

use crate::builder::TxProposal;
use crate::error::Error;

/// Encode the collected signatures into a broadcastable transaction.
///
/// Multisig inputs can only be finalized host side when the device key is
/// the sole signer; thresholds above one need cosigner signatures this
/// crate does not collect.
pub fn finalize_transaction(proposal: &TxProposal) -> Result<Transaction, Error> {
    let mut tx = proposal.unsigned_tx();

    for (i, utxo) in proposal.inputs().iter().enumerate() {
        let sig = proposal
            .slots()
            .get(i)
            .ok_or(Error::IncompleteSignatures(i))?;
        let address = &utxo.address;

        match address.config().script_type() {
            ScriptType::P2pkh => {
                let sig = ecdsa_sig(sig, i)?;
                tx.input[i].script_sig = Builder::new()
                    .push_slice(sig.serialize())
                    .push_slice(address.pubkey().serialize())
                    .into_script();
            }

            ScriptType::P2wpkh => {
                let sig = ecdsa_sig(sig, i)?;
                tx.input[i].witness = Witness::p2wpkh(&sig, address.pubkey());
            }

            ScriptType::P2wpkhP2sh => {
                let sig = ecdsa_sig(sig, i)?;
                let hash = CompressedPublicKey(*address.pubkey()).wpubkey_hash();

                // scriptSig is a single push of the v0 keyhash witness program
                let mut redeem = [0u8; 22];
                redeem[1] = 0x14;
                redeem[2..].copy_from_slice(hash.as_byte_array());

                tx.input[i].script_sig = Builder::new().push_slice(redeem).into_script();
                tx.input[i].witness = Witness::p2wpkh(&sig, address.pubkey());
            }

            ScriptType::P2tr => {
                let sig = schnorr_sig(sig, i)?;
                tx.input[i].witness = Witness::p2tr_key_spend(&sig);
            }

            ScriptType::P2wsh => {
                if address.config().signatures_required() > 1 {
                    return Err(Error::IncompleteSignatures(i));
                }
                let script = address
                    .witness_script()
                    .ok_or(Error::InvalidConfiguration)?;
                let sig = ecdsa_sig(sig, i)?;

                let mut witness = Witness::new();
                // CHECKMULTISIG pops one element more than it verifies
                witness.push([0u8; 0]);
                witness.push(sig.serialize());
                witness.push(script.as_bytes());

                tx.input[i].witness = witness;
            }
        }
    }

    Ok(tx)
}

fn ecdsa_sig(sig: &InputSignature, index: usize) -> Result<ecdsa::Signature, Error> {
    match sig {
        InputSignature::Ecdsa(signature) => Ok(ecdsa::Signature {
            signature: *signature,
            sighash_type: EcdsaSighashType::All,
        }),
        InputSignature::Schnorr(_) => Err(Error::SignatureMismatch(index)),
    }
}

fn schnorr_sig(sig: &InputSignature, index: usize) -> Result<taproot::Signature, Error> {
    match sig {
        InputSignature::Schnorr(signature) => Ok(taproot::Signature {
            signature: *signature,
            sighash_type: TapSighashType::Default,
        }),
        InputSignature::Ecdsa(_) => Err(Error::SignatureMismatch(index)),
    }
}
