// Copyright (c) 2024-2025 The Keyfort Developers

//! Host side transaction verification.
//!
//! Re-derives the signature hash of every input of a finalized
//! transaction from its previous outputs and checks each signature
//! against the public key its script commits to. This is an independent
//! check of what the device produced, run before broadcast.

use std::collections::HashMap;

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Instruction;
use bitcoin::secp256k1::{self, Message, Secp256k1, Verification, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{
    ecdsa, taproot, CompressedPublicKey, OutPoint, PublicKey, Script, ScriptBuf, Transaction,
    TxOut, Witness,
};
use log::debug;

use crate::chain::Blockchain;
use crate::error::Error;

/// Verify every signature of a finalized transaction against the outputs
/// it spends.
///
/// `prevouts` must cover each input's previous output; use
/// [`gather_prevouts`] to collect them from a chain backend. Only the
/// script forms this crate finalizes are accepted, and only the default
/// sighash flags.
pub fn verify_transaction(
    tx: &Transaction,
    prevouts: &HashMap<OutPoint, TxOut>,
) -> Result<(), Error> {
    if tx.input.is_empty() {
        return Err(Error::ValidationFailure("transaction has no inputs".into()));
    }

    let mut spent = Vec::with_capacity(tx.input.len());
    for (i, txin) in tx.input.iter().enumerate() {
        let txout = prevouts.get(&txin.previous_output).ok_or_else(|| {
            fail(
                i,
                format!("unknown previous output {}", txin.previous_output),
            )
        })?;
        spent.push(txout.clone());
    }

    let input_value: u64 = spent
        .iter()
        .map(|o| o.value.to_sat())
        .fold(0, u64::saturating_add);
    let output_value: u64 = tx
        .output
        .iter()
        .map(|o| o.value.to_sat())
        .fold(0, u64::saturating_add);
    if output_value > input_value {
        return Err(Error::ValidationFailure(format!(
            "outputs of {} exceed inputs of {}",
            output_value, input_value
        )));
    }

    let secp = Secp256k1::verification_only();
    let mut cache = SighashCache::new(tx);

    for i in 0..tx.input.len() {
        verify_input(&secp, &mut cache, tx, i, &spent)?;
    }

    debug!("Verified {} inputs", tx.input.len());

    Ok(())
}

/// Collect the previous outputs a transaction spends from a chain backend
pub async fn gather_prevouts<C>(
    chain: &C,
    tx: &Transaction,
) -> Result<HashMap<OutPoint, TxOut>, Error>
where
    C: Blockchain + ?Sized,
{
    let mut prevouts = HashMap::with_capacity(tx.input.len());

    for txin in &tx.input {
        let outpoint = txin.previous_output;
        if prevouts.contains_key(&outpoint) {
            continue;
        }

        let prev = chain.lookup_transaction(outpoint.txid).await?;
        let txout = prev
            .output
            .get(outpoint.vout as usize)
            .cloned()
            .ok_or_else(|| {
                Error::ValidationFailure(format!("previous output {} does not exist", outpoint))
            })?;

        prevouts.insert(outpoint, txout);
    }

    Ok(prevouts)
}

fn verify_input<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    tx: &Transaction,
    index: usize,
    spent: &[TxOut],
) -> Result<(), Error> {
    let prevout = &spent[index];
    let script = prevout.script_pubkey.as_script();
    let txin = &tx.input[index];

    if script.is_p2pkh() {
        if !txin.witness.is_empty() {
            return Err(fail(index, "unexpected witness on a legacy input"));
        }

        let pushes =
            script_sig_pushes(&txin.script_sig).ok_or_else(|| fail(index, "malformed scriptSig"))?;
        let &[sig, pk] = pushes.as_slice() else {
            return Err(fail(index, "legacy scriptSig must push signature and key"));
        };

        let pubkey =
            PublicKey::from_slice(pk).map_err(|e| fail(index, format!("public key: {}", e)))?;
        if ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) != prevout.script_pubkey {
            return Err(fail(index, "public key does not hash to the spent script"));
        }

        let sig = parse_ecdsa(sig, index)?;
        let sighash = cache
            .legacy_signature_hash(index, script, EcdsaSighashType::All.to_u32())
            .map_err(|e| fail(index, e))?;

        verify_ecdsa(secp, sighash.to_byte_array(), &sig, &pubkey.inner, index)
    } else if script.is_p2wpkh() {
        if !txin.script_sig.is_empty() {
            return Err(fail(index, "unexpected scriptSig on a segwit input"));
        }

        verify_keyhash_witness(secp, cache, index, &txin.witness, script, prevout)
    } else if script.is_p2sh() {
        let pushes =
            script_sig_pushes(&txin.script_sig).ok_or_else(|| fail(index, "malformed scriptSig"))?;
        let &[redeem] = pushes.as_slice() else {
            return Err(fail(index, "nested scriptSig must push the redeem script"));
        };

        let redeem = ScriptBuf::from_bytes(redeem.to_vec());
        if redeem.to_p2sh() != prevout.script_pubkey {
            return Err(fail(index, "redeem script does not hash to the spent script"));
        }
        if !redeem.is_p2wpkh() {
            return Err(fail(index, "unsupported redeem script"));
        }

        verify_keyhash_witness(secp, cache, index, &txin.witness, &redeem, prevout)
    } else if script.is_p2wsh() {
        if !txin.script_sig.is_empty() {
            return Err(fail(index, "unexpected scriptSig on a segwit input"));
        }

        verify_multisig_witness(secp, cache, index, &txin.witness, prevout)
    } else if script.is_p2tr() {
        if !txin.script_sig.is_empty() {
            return Err(fail(index, "unexpected scriptSig on a taproot input"));
        }
        if txin.witness.len() != 1 {
            return Err(fail(index, "taproot key spend needs exactly one witness item"));
        }

        let sig = txin
            .witness
            .nth(0)
            .and_then(|b| taproot::Signature::from_slice(b).ok())
            .ok_or_else(|| fail(index, "malformed taproot signature"))?;
        if sig.sighash_type != TapSighashType::Default {
            return Err(fail(index, "unexpected sighash type"));
        }

        // The witness program of a taproot output is its tweaked key
        let output_key = XOnlyPublicKey::from_slice(&script.as_bytes()[2..])
            .map_err(|e| fail(index, format!("output key: {}", e)))?;

        let sighash = cache
            .taproot_key_spend_signature_hash(index, &Prevouts::All(spent), TapSighashType::Default)
            .map_err(|e| fail(index, e))?;
        let msg = Message::from_digest(sighash.to_byte_array());

        secp.verify_schnorr(&sig.signature, &msg, &output_key)
            .map_err(|_| fail(index, "signature does not verify"))
    } else {
        Err(fail(index, "unsupported script type"))
    }
}

/// Verify a `[signature, pubkey]` witness against a keyhash program,
/// covering both native P2WPKH and the P2SH nested form
fn verify_keyhash_witness<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    witness: &Witness,
    script_code: &Script,
    prevout: &TxOut,
) -> Result<(), Error> {
    if witness.len() != 2 {
        return Err(fail(index, "keyhash witness needs signature and key"));
    }

    let sig = parse_ecdsa(
        witness.nth(0).ok_or_else(|| fail(index, "missing signature"))?,
        index,
    )?;

    let pk = witness.nth(1).ok_or_else(|| fail(index, "missing public key"))?;
    if pk.len() != 33 {
        return Err(fail(index, "public key must be compressed"));
    }
    let pubkey = CompressedPublicKey(
        secp256k1::PublicKey::from_slice(pk)
            .map_err(|e| fail(index, format!("public key: {}", e)))?,
    );

    if ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash()) != *script_code {
        return Err(fail(index, "public key does not hash to the witness program"));
    }

    let sighash = cache
        .p2wpkh_signature_hash(index, script_code, prevout.value, EcdsaSighashType::All)
        .map_err(|e| fail(index, e))?;

    verify_ecdsa(secp, sighash.to_byte_array(), &sig, &pubkey.0, index)
}

fn verify_multisig_witness<C: Verification>(
    secp: &Secp256k1<C>,
    cache: &mut SighashCache<&Transaction>,
    index: usize,
    witness: &Witness,
    prevout: &TxOut,
) -> Result<(), Error> {
    if witness.len() < 3 {
        return Err(fail(index, "multisig witness too short"));
    }

    let script_bytes = witness
        .nth(witness.len() - 1)
        .ok_or_else(|| fail(index, "missing witness script"))?;
    let witness_script = ScriptBuf::from_bytes(script_bytes.to_vec());
    if witness_script.to_p2wsh() != prevout.script_pubkey {
        return Err(fail(index, "witness script does not hash to the spent script"));
    }

    let (threshold, pubkeys) = parse_multisig(&witness_script)
        .ok_or_else(|| fail(index, "witness script is not a CHECKMULTISIG template"))?;

    let dummy = witness.nth(0).ok_or_else(|| fail(index, "missing dummy element"))?;
    if !dummy.is_empty() {
        return Err(fail(index, "CHECKMULTISIG dummy element must be empty"));
    }

    let sig_count = witness.len() - 2;
    if sig_count < threshold {
        return Err(fail(
            index,
            format!(
                "{} signatures for a {} of {} script",
                sig_count,
                threshold,
                pubkeys.len()
            ),
        ));
    }

    let sighash = cache
        .p2wsh_signature_hash(index, &witness_script, prevout.value, EcdsaSighashType::All)
        .map_err(|e| fail(index, e))?;
    let msg = Message::from_digest(sighash.to_byte_array());

    // CHECKMULTISIG semantics: signatures must follow key order
    let mut key_cursor = 0;
    for w in 1..=sig_count {
        let sig = parse_ecdsa(
            witness.nth(w).ok_or_else(|| fail(index, "missing signature"))?,
            index,
        )?;

        let mut matched = false;
        while key_cursor < pubkeys.len() {
            let key = &pubkeys[key_cursor];
            key_cursor += 1;
            if secp.verify_ecdsa(&msg, &sig.signature, key).is_ok() {
                matched = true;
                break;
            }
        }
        if !matched {
            return Err(fail(index, "signature does not match any key in script order"));
        }
    }

    Ok(())
}

fn parse_multisig(script: &Script) -> Option<(usize, Vec<secp256k1::PublicKey>)> {
    let mut instructions = script.instructions();

    let threshold = push_num(instructions.next()?.ok()?)?;

    let mut pubkeys = Vec::new();
    let mut total = None;
    for inst in instructions.by_ref() {
        match inst.ok()? {
            Instruction::PushBytes(b) if b.len() == 33 => {
                pubkeys.push(secp256k1::PublicKey::from_slice(b.as_bytes()).ok()?);
            }
            other => {
                total = push_num(other);
                break;
            }
        }
    }
    let total = total?;

    match instructions.next()?.ok()? {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => (),
        _ => return None,
    }
    if instructions.next().is_some() {
        return None;
    }

    (total == pubkeys.len() && (1..=total).contains(&threshold)).then_some((threshold, pubkeys))
}

fn push_num(inst: Instruction) -> Option<usize> {
    match inst {
        Instruction::Op(op) => {
            let n = op.to_u8();
            // OP_PUSHNUM_1 through OP_PUSHNUM_16
            (0x51..=0x60).contains(&n).then(|| (n - 0x50) as usize)
        }
        Instruction::PushBytes(_) => None,
    }
}

fn script_sig_pushes(script_sig: &Script) -> Option<Vec<&[u8]>> {
    let mut pushes = Vec::new();
    for inst in script_sig.instructions() {
        match inst.ok()? {
            Instruction::PushBytes(b) => pushes.push(b.as_bytes()),
            Instruction::Op(_) => return None,
        }
    }
    Some(pushes)
}

fn parse_ecdsa(bytes: &[u8], index: usize) -> Result<ecdsa::Signature, Error> {
    let sig = ecdsa::Signature::from_slice(bytes)
        .map_err(|e| fail(index, format!("signature: {}", e)))?;
    if sig.sighash_type != EcdsaSighashType::All {
        return Err(fail(index, "unexpected sighash type"));
    }
    Ok(sig)
}

fn verify_ecdsa<C: Verification>(
    secp: &Secp256k1<C>,
    digest: [u8; 32],
    sig: &ecdsa::Signature,
    key: &secp256k1::PublicKey,
    index: usize,
) -> Result<(), Error> {
    let msg = Message::from_digest(digest);
    secp.verify_ecdsa(&msg, &sig.signature, key)
        .map_err(|_| fail(index, "signature does not verify"))
}

fn fail(index: usize, detail: impl std::fmt::Display) -> Error {
    Error::ValidationFailure(format!("input {}: {}", index, detail))
}
