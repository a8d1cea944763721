// Copyright (c) 2024-2025 The Keyfort Developers

//! In-memory blockchain backend

use std::collections::HashMap;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use keyfort::chain::ChainError;
use keyfort::{AccountAddress, AccountCode, Blockchain, Utxo};

/// Fixed set of transactions and unspent outputs
#[derive(Default)]
pub struct MockChain {
    transactions: HashMap<Txid, Transaction>,
    unspent: HashMap<AccountCode, Vec<Utxo>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a transaction paying `value` to `address` and credit the
    /// output to `account`
    pub fn fund(
        &mut self,
        account: &AccountCode,
        address: &AccountAddress,
        value: Amount,
    ) -> OutPoint {
        // Distinct dummy inputs keep the funding txids distinct
        let tag = self.transactions.len() as u32;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::all_zeros(),
                    vout: tag,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value,
                script_pubkey: address.script_pubkey().clone(),
            }],
        };

        let outpoint = OutPoint {
            txid: tx.compute_txid(),
            vout: 0,
        };

        self.unspent.entry(account.clone()).or_default().push(Utxo {
            outpoint,
            txout: tx.output[0].clone(),
            address: address.clone(),
        });
        self.transactions.insert(outpoint.txid, tx);

        outpoint
    }
}

#[async_trait]
impl Blockchain for MockChain {
    async fn lookup_transaction(&self, txid: Txid) -> Result<Transaction, ChainError> {
        self.transactions
            .get(&txid)
            .cloned()
            .ok_or(ChainError::NotFound(txid))
    }

    async fn list_unspent(&self, account: &AccountCode) -> Result<Vec<Utxo>, ChainError> {
        Ok(self.unspent.get(account).cloned().unwrap_or_default())
    }
}
