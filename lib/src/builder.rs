// Copyright (c) 2024-2025 The Keyfort Developers

//! Transaction construction.
//!
//! Builds unsigned transaction proposals from spendable outputs: inputs
//! are selected largest first, the fee is iterated to a fixpoint of the
//! estimated transaction weight, and the remainder goes to a change
//! address unless it would be dust.

use std::collections::HashMap;

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight, Witness,
};
use log::debug;

use keyfort_proto::{Coin, ScriptType};

use crate::account::AccountAddress;
use crate::error::Error;
use crate::signer::SignatureSlots;

/// Minimum relay fee in satoshi per kilo-vbyte, the dust reference rate
pub const RELAY_FEE_PER_KVB: u64 = 1_000;

/// Worst case DER signature length, sighash flag included
const MAX_SIGNATURE_LEN: u64 = 72;

/// Schnorr signature length with an explicit sighash flag
const MAX_SCHNORR_SIGNATURE_LEN: u64 = 65;

/// Compressed public key length
const PUBKEY_LEN: u64 = 33;

/// Spendable output of an account
#[derive(Clone, Debug)]
pub struct Utxo {
    /// Location of the output
    pub outpoint: OutPoint,
    /// The output itself
    pub txout: TxOut,
    /// Address the output pays, carrying its signing configuration
    pub address: AccountAddress,
}

/// Payment target of a proposal
#[derive(Clone, Debug)]
pub struct TxTarget {
    /// Amount to send
    pub value: Amount,
    /// Output script of the recipient
    pub script_pubkey: ScriptBuf,
}

/// Unsigned transaction proposal with its signature slots.
///
/// Inputs always balance outputs plus fee. The signature slots are filled
/// by [`KeystoreClient::sign_transaction`][crate::KeystoreClient::sign_transaction]
/// and consumed by [`finalize_transaction`][crate::finalize::finalize_transaction].
#[derive(Debug)]
pub struct TxProposal {
    coin: Coin,
    inputs: Vec<Utxo>,
    outputs: Vec<TxOut>,
    change_index: Option<usize>,
    change_address: Option<AccountAddress>,
    fee: Amount,
    fee_rate_per_kvb: u64,
    slots: SignatureSlots,
}

impl TxProposal {
    /// Coin the proposal spends
    pub fn coin(&self) -> Coin {
        self.coin
    }

    /// Selected inputs, in final transaction order
    pub fn inputs(&self) -> &[Utxo] {
        &self.inputs
    }

    /// Outputs, in final transaction order
    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    /// Change output, when one exists
    pub fn change_output(&self) -> Option<&TxOut> {
        self.change_index.map(|i| &self.outputs[i])
    }

    /// Address the change output pays, when one exists
    pub fn change_address(&self) -> Option<&AccountAddress> {
        self.change_address.as_ref()
    }

    pub(crate) fn change_index(&self) -> Option<usize> {
        self.change_index
    }

    /// Fee paid by the proposal
    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Fee rate the proposal was built for, in satoshi per kilo-vbyte
    pub fn fee_rate_per_kvb(&self) -> u64 {
        self.fee_rate_per_kvb
    }

    /// Total value of the selected inputs
    pub fn input_value(&self) -> Amount {
        sum_sats(self.inputs.iter().map(|u| u.txout.value))
    }

    /// Total value of the outputs
    pub fn output_value(&self) -> Amount {
        sum_sats(self.outputs.iter().map(|o| o.value))
    }

    /// Signatures collected so far, one slot per input
    pub fn slots(&self) -> &SignatureSlots {
        &self.slots
    }

    pub(crate) fn slots_mut(&mut self) -> &mut SignatureSlots {
        &mut self.slots
    }

    /// Transaction skeleton without signatures
    pub fn unsigned_tx(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|u| TxIn {
                    previous_output: u.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }
}

/// Build a transaction proposal paying `targets` from `utxos`.
///
/// Selection is deterministic: candidates are tried largest value first
/// with the outpoint as tie break, and the fee is re-estimated until it
/// covers the weight of the selected set. Change below the dust bound is
/// absorbed into the fee.
pub fn build_proposal(
    coin: Coin,
    utxos: &HashMap<OutPoint, Utxo>,
    targets: &[TxTarget],
    fee_rate_per_kvb: u64,
    change: &AccountAddress,
) -> Result<TxProposal, Error> {
    if targets.is_empty() {
        return Err(Error::InvalidTarget);
    }
    for t in targets {
        if t.value == Amount::ZERO || t.value > Amount::MAX_MONEY || t.script_pubkey.is_empty() {
            return Err(Error::InvalidTarget);
        }
    }

    let target_value = sum_sats(targets.iter().map(|t| t.value)).to_sat();

    // Largest first, outpoint as deterministic tie break
    let mut candidates: Vec<&Utxo> = utxos.values().collect();
    candidates.sort_by(|a, b| {
        b.txout
            .value
            .cmp(&a.txout.value)
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });

    let available = sum_sats(candidates.iter().map(|u| u.txout.value)).to_sat();

    let mut fee = 0u64;
    let (selected, selected_value) = loop {
        let needed = target_value.saturating_add(fee);
        let (selected, selected_value) = select_utxos(&candidates, needed, available)?;

        let weight = transaction_weight(&selected, targets, change.script_pubkey());
        let required = fee_for_weight(fee_rate_per_kvb, weight);

        // A higher fee can pull in more inputs and grow the transaction,
        // so iterate until the estimate stops rising
        if required <= fee {
            break (selected, selected_value);
        }
        fee = required;
    };

    let change_value = selected_value - target_value - fee;

    let mut outputs: Vec<TxOut> = targets
        .iter()
        .map(|t| TxOut {
            value: t.value,
            script_pubkey: t.script_pubkey.clone(),
        })
        .collect();

    let change_script = change.script_pubkey();
    let change_index = if change_value > 0 && !is_dust(Amount::from_sat(change_value), change_script)
    {
        outputs.push(TxOut {
            value: Amount::from_sat(change_value),
            script_pubkey: change_script.clone(),
        });
        Some(outputs.len() - 1)
    } else {
        if change_value > 0 {
            debug!(
                "Absorbing dust change of {} into the fee",
                Amount::from_sat(change_value)
            );
        }
        fee += change_value;
        None
    };

    let inputs: Vec<Utxo> = selected.into_iter().cloned().collect();

    debug!(
        "Built proposal: {} inputs, {} outputs, fee {} at {} sat/kvB",
        inputs.len(),
        outputs.len(),
        Amount::from_sat(fee),
        fee_rate_per_kvb,
    );

    let slots = SignatureSlots::new(inputs.len());

    Ok(TxProposal {
        coin,
        inputs,
        outputs,
        change_index,
        change_address: change_index.map(|_| change.clone()),
        fee: Amount::from_sat(fee),
        fee_rate_per_kvb,
        slots,
    })
}

fn select_utxos<'a>(
    candidates: &[&'a Utxo],
    needed: u64,
    available: u64,
) -> Result<(Vec<&'a Utxo>, u64), Error> {
    let mut value = 0u64;
    let mut selected = Vec::new();

    for u in candidates {
        if value >= needed {
            break;
        }
        selected.push(*u);
        value = value.saturating_add(u.txout.value.to_sat());
    }

    if value < needed {
        return Err(Error::InsufficientFunds {
            available: Amount::from_sat(available),
            needed: Amount::from_sat(needed),
        });
    }

    Ok((selected, value))
}

/// Whether an output of `value` paying `script` costs more than a third of
/// its value to spend at the relay fee rate
pub fn is_dust(value: Amount, script: &Script) -> bool {
    let len = script.len() as u64;
    // serialized output size plus a worst case redeeming input
    let total = 8 + compact_size(len) + len + 148;

    value.to_sat().saturating_mul(1000) / (3 * total) < RELAY_FEE_PER_KVB
}

/// Weight contributed by one input spending `address`
pub(crate) fn input_weight(address: &AccountAddress) -> Weight {
    let config = address.config();

    let (script_sig_len, witness_len) = match config.script_type() {
        // scriptSig: signature push, pubkey push
        ScriptType::P2pkh => (
            witness_item(MAX_SIGNATURE_LEN) + witness_item(PUBKEY_LEN),
            0,
        ),
        // witness: signature, pubkey
        ScriptType::P2wpkh => (
            0,
            1 + witness_item(MAX_SIGNATURE_LEN) + witness_item(PUBKEY_LEN),
        ),
        // scriptSig: push of the 22 byte redeem script, witness as P2WPKH
        ScriptType::P2wpkhP2sh => (
            witness_item(22),
            1 + witness_item(MAX_SIGNATURE_LEN) + witness_item(PUBKEY_LEN),
        ),
        // witness: one Schnorr signature
        ScriptType::P2tr => (0, 1 + witness_item(MAX_SCHNORR_SIGNATURE_LEN)),
        // witness: CHECKMULTISIG dummy, threshold signatures, witness script
        ScriptType::P2wsh => {
            let script_len = address.witness_script().map(|s| s.len() as u64).unwrap_or(0);
            let k = config.signatures_required() as u64;

            (
                0,
                1 + witness_item(0) + k * witness_item(MAX_SIGNATURE_LEN) + witness_item(script_len),
            )
        }
    };

    let base = 36 + compact_size(script_sig_len) + script_sig_len + 4;

    Weight::from_wu(base * 4 + witness_len)
}

/// Weight contributed by one output paying `script`
fn output_weight(script: &Script) -> Weight {
    let len = script.len() as u64;
    Weight::from_wu((8 + compact_size(len) + len) * 4)
}

/// Weight of the whole transaction over the selected inputs, targets, and
/// a change output
fn transaction_weight(inputs: &[&Utxo], targets: &[TxTarget], change_script: &Script) -> Weight {
    let has_witness = inputs
        .iter()
        .any(|u| u.address.config().script_type() != ScriptType::P2pkh);

    // version, input and output counts, lock time, plus segwit marker and
    // flag when any input carries a witness
    let mut weight = Weight::from_wu(
        (4 + compact_size(inputs.len() as u64) + compact_size(targets.len() as u64 + 1) + 4) * 4
            + if has_witness { 2 } else { 0 },
    );

    for u in inputs {
        weight += input_weight(&u.address);
    }
    for t in targets {
        weight += output_weight(&t.script_pubkey);
    }
    weight += output_weight(change_script);

    weight
}

/// Fee for a transaction of the given weight, floor division per kvB
fn fee_for_weight(fee_rate_per_kvb: u64, weight: Weight) -> u64 {
    fee_rate_per_kvb.saturating_mul(weight.to_vbytes_ceil()) / 1000
}

/// Serialized length of a compact size integer
fn compact_size(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Serialized length of a witness stack item of `n` bytes, or of a data
/// push of `n` bytes inside a scriptSig
fn witness_item(n: u64) -> u64 {
    compact_size(n) + n
}

fn sum_sats(amounts: impl Iterator<Item = Amount>) -> Amount {
    Amount::from_sat(
        amounts
            .map(|a| a.to_sat())
            .fold(0u64, u64::saturating_add),
    )
}
