// Copyright (c) 2024-2025 The Keyfort Developers

//! Signing coordination internals.
//!
//! Resolves proposal inputs to their signing configurations, gathers the
//! previous transactions the device verifies amounts against, and
//! assembles the single signing request. The device exchange itself lives
//! in [`keystore`][crate::keystore].

use std::sync::Arc;

use bitcoin::{Transaction, Txid};
use log::{debug, warn};

use keyfort_proto::{
    AbsoluteKeypath, InputSignature, OutputPayload, SighashFamily, SignRequest, TxInputDescriptor,
    TxOutputDescriptor,
};

use crate::account::SigningConfig;
use crate::builder::TxProposal;
use crate::chain::Blockchain;
use crate::error::Error;

/// Per input signature slots of a proposal.
///
/// Slots are write once: filling an occupied slot is refused, so repeated
/// signing flows cannot silently replace signatures.
#[derive(Debug)]
pub struct SignatureSlots {
    slots: Vec<Option<InputSignature>>,
}

impl SignatureSlots {
    pub(crate) fn new(len: usize) -> Self {
        Self {
            slots: vec![None; len],
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether there are no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Signature for an input, when present
    pub fn get(&self, index: usize) -> Option<&InputSignature> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    /// Whether every slot is filled
    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// First unfilled slot
    pub fn first_empty(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub(crate) fn set(&mut self, index: usize, sig: InputSignature) -> Result<(), Error> {
        match self.slots.get_mut(index) {
            Some(slot @ None) => {
                *slot = Some(sig);
                Ok(())
            }
            Some(_) => Err(Error::SlotOccupied(index)),
            None => Err(Error::UnexpectedResponse),
        }
    }
}

/// Input resolved against its signing configuration
pub(crate) struct ResolvedInput {
    pub config_index: u32,
    pub keypath: AbsoluteKeypath,
    pub family: SighashFamily,
}

/// Distinct signing configurations of a proposal with per input resolution
pub(crate) struct Resolution {
    pub configs: Vec<Arc<SigningConfig>>,
    pub inputs: Vec<ResolvedInput>,
    pub change_config_index: Option<u32>,
}

/// Resolve every input, and the change output when present, to a signing
/// configuration, failing fast on inconsistent annotations
pub(crate) fn resolve_inputs(proposal: &TxProposal) -> Result<Resolution, Error> {
    let mut configs: Vec<Arc<SigningConfig>> = Vec::new();
    let mut config_index = |config: &Arc<SigningConfig>| -> u32 {
        match configs.iter().position(|c| Arc::ptr_eq(c, config)) {
            Some(i) => i as u32,
            None => {
                configs.push(config.clone());
                (configs.len() - 1) as u32
            }
        }
    };

    let mut inputs = Vec::with_capacity(proposal.inputs().len());
    for (i, utxo) in proposal.inputs().iter().enumerate() {
        let address = &utxo.address;

        // The annotation must actually fund this outpoint
        if address.script_pubkey() != &utxo.txout.script_pubkey {
            warn!("Input {} script does not match its address annotation", i);
            return Err(Error::InputResolutionFailure(i));
        }

        let config = address.config();
        inputs.push(ResolvedInput {
            config_index: config_index(config),
            keypath: address.keypath(),
            family: config.script_type().sighash_family(),
        });
    }

    let change_config_index = proposal
        .change_address()
        .map(|addr| config_index(addr.config()));

    debug!(
        "Resolved {} inputs over {} script configs",
        inputs.len(),
        configs.len()
    );

    Ok(Resolution {
        configs,
        inputs,
        change_config_index,
    })
}

/// Fetch the previous transaction of every input whose sighash family
/// requires one, deduplicated by txid
pub(crate) async fn collect_previous_transactions<C: Blockchain + ?Sized>(
    chain: &C,
    proposal: &TxProposal,
    resolution: &Resolution,
) -> Result<Vec<Transaction>, Error> {
    let mut wanted: Vec<Txid> = Vec::new();
    for (utxo, resolved) in proposal.inputs().iter().zip(&resolution.inputs) {
        if resolved.family.requires_previous_transaction() && !wanted.contains(&utxo.outpoint.txid)
        {
            wanted.push(utxo.outpoint.txid);
        }
    }

    let mut prev_txs = Vec::with_capacity(wanted.len());
    for txid in wanted {
        let tx = chain.lookup_transaction(txid).await?;

        // A backend returning the wrong transaction is as good as none
        if tx.compute_txid() != txid {
            warn!("Backend returned mismatched transaction for {}", txid);
            return Err(Error::PreviousTransactionUnavailable(txid));
        }

        prev_txs.push(tx);
    }

    debug!("Collected {} previous transactions", prev_txs.len());

    Ok(prev_txs)
}

/// Assemble the single signing request covering the whole proposal
pub(crate) fn build_sign_request(
    proposal: &TxProposal,
    resolution: &Resolution,
    prev_txs: Vec<Transaction>,
) -> SignRequest {
    let unsigned = proposal.unsigned_tx();

    let mut inputs = Vec::with_capacity(proposal.inputs().len());
    for ((utxo, resolved), txin) in proposal
        .inputs()
        .iter()
        .zip(&resolution.inputs)
        .zip(&unsigned.input)
    {
        inputs.push(TxInputDescriptor {
            outpoint: utxo.outpoint,
            value: utxo.txout.value,
            sequence: txin.sequence,
            keypath: resolved.keypath.clone(),
            config_index: resolved.config_index,
        });
    }

    let mut outputs = Vec::with_capacity(proposal.outputs().len());
    for (i, out) in proposal.outputs().iter().enumerate() {
        let payload = match (proposal.change_address(), resolution.change_config_index) {
            (Some(addr), Some(config_index)) if proposal.change_index() == Some(i) => {
                OutputPayload::Internal {
                    config_index,
                    keypath: addr.keypath(),
                }
            }
            _ => OutputPayload::External(out.script_pubkey.clone()),
        };

        outputs.push(TxOutputDescriptor {
            value: out.value,
            payload,
        });
    }

    SignRequest {
        coin: proposal.coin(),
        script_configs: resolution.configs.iter().map(|c| c.to_proto()).collect(),
        version: unsigned.version,
        lock_time: unsigned.lock_time,
        inputs,
        outputs,
        prev_txs,
    }
}

/// Atomically install the device signatures into the proposal slots.
///
/// The response must carry exactly one signature per input, each matching
/// its input's sighash family; anything else leaves the slots untouched.
pub(crate) fn fill_slots(
    proposal: &mut TxProposal,
    resolution: &Resolution,
    signatures: Vec<InputSignature>,
) -> Result<(), Error> {
    if signatures.len() != proposal.inputs().len() {
        warn!(
            "Signature count mismatch: {} returned for {} inputs",
            signatures.len(),
            proposal.inputs().len()
        );
        return Err(Error::UnexpectedResponse);
    }

    for (i, (sig, resolved)) in signatures.iter().zip(&resolution.inputs).enumerate() {
        let family_ok = matches!(
            (sig, resolved.family),
            (
                InputSignature::Ecdsa(_),
                SighashFamily::Legacy | SighashFamily::SegwitV0
            ) | (InputSignature::Schnorr(_), SighashFamily::Taproot)
        );

        if !family_ok {
            return Err(Error::SignatureMismatch(i));
        }
    }

    for (i, sig) in signatures.into_iter().enumerate() {
        proposal.slots_mut().set(i, sig)?;
    }

    Ok(())
}
