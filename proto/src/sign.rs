// Copyright (c) 2024-2025 The Keyfort Developers

//! Transaction signing request payloads.
//!
//! A [`SignRequest`] carries everything the device needs to validate and
//! sign a transaction in one exchange: the transaction skeleton, per input
//! keypaths, the signing configurations they reference, and the previous
//! transactions backing every non taproot input.

use bitcoin::secp256k1::{ecdsa, schnorr};
use bitcoin::{absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction};

use crate::coin::Coin;
use crate::keypath::AbsoluteKeypath;
use crate::script::ScriptConfig;

/// Complete signing context for one transaction
#[derive(Clone, Debug, PartialEq)]
pub struct SignRequest {
    /// Coin the transaction spends
    pub coin: Coin,
    /// Signing configurations referenced by inputs and internal outputs
    pub script_configs: Vec<ScriptConfig>,
    /// Transaction version
    pub version: transaction::Version,
    /// Transaction lock time
    pub lock_time: absolute::LockTime,
    /// Inputs to sign, in final transaction order
    pub inputs: Vec<TxInputDescriptor>,
    /// Outputs, in final transaction order
    pub outputs: Vec<TxOutputDescriptor>,
    /// Previous transactions for amount verification, deduplicated
    pub prev_txs: Vec<Transaction>,
}

/// One transaction input awaiting a signature
#[derive(Clone, Debug, PartialEq)]
pub struct TxInputDescriptor {
    /// Output being spent
    pub outpoint: OutPoint,
    /// Value of the output being spent
    pub value: Amount,
    /// Sequence number
    pub sequence: Sequence,
    /// Full keypath of the key that controls the output
    pub keypath: AbsoluteKeypath,
    /// Index into [`SignRequest::script_configs`]
    pub config_index: u32,
}

/// One transaction output
#[derive(Clone, Debug, PartialEq)]
pub struct TxOutputDescriptor {
    /// Value carried by the output
    pub value: Amount,
    /// Destination of the output
    pub payload: OutputPayload,
}

/// Output destination, either an opaque script or a wallet internal address
#[derive(Clone, Debug, PartialEq)]
pub enum OutputPayload {
    /// Payment to an address outside the wallet, script given verbatim
    External(ScriptBuf),

    /// Change back to the wallet; the device derives and checks the script
    Internal {
        /// Index into [`SignRequest::script_configs`]
        config_index: u32,
        /// Full keypath of the change address
        keypath: AbsoluteKeypath,
    },
}

/// Signature for a single input
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum InputSignature {
    /// ECDSA signature for legacy and segwit v0 inputs
    Ecdsa(ecdsa::Signature),
    /// BIP-340 signature for taproot key spends
    Schnorr(schnorr::Signature),
}
