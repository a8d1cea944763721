// Copyright (c) 2024-2025 The Keyfort Developers

//! End to end signing tests

use std::collections::HashMap;
use std::future::pending;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Amount, CompressedPublicKey, Network, OutPoint, ScriptBuf};
use log::{debug, info};

use keyfort::proto::{AbsoluteKeypath, Coin, RelativeKeypath, ScriptType};
use keyfort::{
    build_proposal, finalize_transaction, gather_prevouts, verify_transaction, AccountCode,
    Blockchain, DeviceLink, Error, KeyInfo, KeystoreClient, PairingSession, SigningConfig,
    Transport, TxProposal, TxTarget, Utxo,
};

use crate::chain::MockChain;

/// Fee rate used by every scenario, sat/kvB
const FEE_RATE: u64 = 1_000;

fn utxo_map(utxos: Vec<Utxo>) -> HashMap<OutPoint, Utxo> {
    utxos.into_iter().map(|u| (u.outpoint, u)).collect()
}

async fn account_config<T: Transport>(
    keystore: &KeystoreClient<T>,
    script_type: ScriptType,
    path: &str,
) -> anyhow::Result<Arc<SigningConfig>> {
    let keypath = AbsoluteKeypath::from_str(path)?;
    let xpub = keystore.extended_public_key(Coin::Btc, &keypath).await?;

    Ok(SigningConfig::simple(
        script_type,
        KeyInfo {
            root_fingerprint: keystore.root_fingerprint().await?,
            keypath,
            xpub,
        },
    )?)
}

/// One funded p2wpkh account with a spend proposal ready to sign
async fn segwit_spend<T: Transport>(
    keystore: &KeystoreClient<T>,
) -> anyhow::Result<(MockChain, TxProposal)> {
    let secp = Secp256k1::new();
    let config = account_config(keystore, ScriptType::P2wpkh, "m/84'/0'/0'").await?;

    let account = AccountCode::from("spend");
    let mut chain = MockChain::new();
    let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;
    chain.fund(&account, &address, Amount::from_sat(1_000_000));

    let change = config.derive_address(&secp, Coin::Btc, RelativeKeypath::change(0)?)?;
    let dest = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(5)?)?;

    let proposal = build_proposal(
        Coin::Btc,
        &utxo_map(chain.list_unspent(&account).await?),
        &[TxTarget {
            value: Amount::from_sat(400_000),
            script_pubkey: dest.script_pubkey().clone(),
        }],
        FEE_RATE,
        &change,
    )?;

    Ok((chain, proposal))
}

/// Sign, finalize and verify the proposal against `chain`
async fn complete<T: Transport, C: Blockchain>(
    keystore: &KeystoreClient<T>,
    chain: &C,
    proposal: &mut TxProposal,
) -> anyhow::Result<()> {
    keystore.sign_transaction(chain, proposal, pending()).await?;
    assert!(proposal.slots().is_complete());

    let tx = finalize_transaction(proposal)?;
    debug!("Finalized {}", tx.compute_txid());

    let prevouts = gather_prevouts(chain, &tx).await?;
    verify_transaction(&tx, &prevouts)?;

    Ok(())
}

/// Sign a transaction drawing on taproot, native segwit and wrapped
/// segwit inputs at once
pub async fn mixed_script_types<T: Transport>(t: T) -> anyhow::Result<()> {
    let secp = Secp256k1::new();
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let configs = [
        account_config(&keystore, ScriptType::P2tr, "m/86'/0'/0'").await?,
        account_config(&keystore, ScriptType::P2wpkh, "m/84'/0'/0'").await?,
        account_config(&keystore, ScriptType::P2wpkhP2sh, "m/49'/0'/0'").await?,
    ];

    let account = AccountCode::from("mixed");
    let mut chain = MockChain::new();
    for config in &configs {
        let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;
        chain.fund(&account, &address, Amount::from_sat(100_000_000));
    }

    let change = configs[0].derive_address(&secp, Coin::Btc, RelativeKeypath::change(0)?)?;
    let dest = configs[0].derive_address(&secp, Coin::Btc, RelativeKeypath::receive(10)?)?;

    let mut proposal = build_proposal(
        Coin::Btc,
        &utxo_map(chain.list_unspent(&account).await?),
        &[TxTarget {
            value: Amount::from_sat(250_000_000),
            script_pubkey: dest.script_pubkey().clone(),
        }],
        FEE_RATE,
        &change,
    )?;

    info!(
        "Proposal: {} inputs, fee {}",
        proposal.inputs().len(),
        proposal.fee()
    );
    assert_eq!(proposal.inputs().len(), 3);
    assert!(proposal.change_output().is_some());

    complete(&keystore, &chain, &mut proposal).await
}

/// Sign a spend from a 1 of 2 multisig account where the device holds the
/// first key
pub async fn multisig_round_trip<T: Transport>(t: T) -> anyhow::Result<()> {
    let secp = Secp256k1::new();
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let keypath = AbsoluteKeypath::from_str("m/48'/0'/0'/2'")?;
    let our_key = KeyInfo {
        root_fingerprint: keystore.root_fingerprint().await?,
        keypath: keypath.clone(),
        xpub: keystore.extended_public_key(Coin::Btc, &keypath).await?,
    };

    // Cosigner key local to the test
    let cosigner_master = Xpriv::new_master(Network::Bitcoin, &[0x5a; 32])?;
    let cosigner_account = cosigner_master.derive_priv(&secp, keypath.path())?;
    let cosigner_key = KeyInfo {
        root_fingerprint: cosigner_master.fingerprint(&secp),
        keypath,
        xpub: Xpub::from_priv(&secp, &cosigner_account),
    };

    let cosigner_pubkey = CompressedPublicKey(cosigner_key.xpub.public_key);
    let config = SigningConfig::multisig(1, vec![our_key, cosigner_key], 0)?;

    let account = AccountCode::from("multisig");
    let mut chain = MockChain::new();
    let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;
    chain.fund(&account, &address, Amount::from_sat(1_000_000));

    let change = config.derive_address(&secp, Coin::Btc, RelativeKeypath::change(0)?)?;
    let mut proposal = build_proposal(
        Coin::Btc,
        &utxo_map(chain.list_unspent(&account).await?),
        &[TxTarget {
            value: Amount::from_sat(600_000),
            script_pubkey: ScriptBuf::new_p2wpkh(&cosigner_pubkey.wpubkey_hash()),
        }],
        FEE_RATE,
        &change,
    )?;

    complete(&keystore, &chain, &mut proposal).await
}

/// Sign a legacy p2pkh spend, which requires previous transaction
/// verification on the device
pub async fn legacy_round_trip<T: Transport>(t: T) -> anyhow::Result<()> {
    let secp = Secp256k1::new();
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let config = account_config(&keystore, ScriptType::P2pkh, "m/44'/0'/0'").await?;

    let account = AccountCode::from("legacy");
    let mut chain = MockChain::new();
    let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;
    chain.fund(&account, &address, Amount::from_sat(1_000_000));

    let change = config.derive_address(&secp, Coin::Btc, RelativeKeypath::change(0)?)?;
    let dest = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(1)?)?;

    let mut proposal = build_proposal(
        Coin::Btc,
        &utxo_map(chain.list_unspent(&account).await?),
        &[TxTarget {
            value: Amount::from_sat(500_000),
            script_pubkey: dest.script_pubkey().clone(),
        }],
        FEE_RATE,
        &change,
    )?;

    complete(&keystore, &chain, &mut proposal).await
}

/// The device user rejects the transaction. The device must be scripted
/// to reject approvals.
pub async fn user_abort<T: Transport>(t: T) -> anyhow::Result<()> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let (chain, mut proposal) = segwit_spend(&keystore).await?;

    let err = keystore
        .sign_transaction(&chain, &mut proposal, pending())
        .await
        .expect_err("transaction signed");
    assert!(matches!(err, Error::UserAborted));
    assert!(!proposal.slots().is_complete());

    Ok(())
}

/// The host cancels while the device waits for approval. The device must
/// be scripted to delay its approval beyond the cancellation.
pub async fn cancelled<T: Transport>(t: T) -> anyhow::Result<()> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let (chain, mut proposal) = segwit_spend(&keystore).await?;

    let cancel = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    let err = keystore
        .sign_transaction(&chain, &mut proposal, cancel)
        .await
        .expect_err("transaction signed");
    assert!(matches!(err, Error::UserAborted));
    assert!(!proposal.slots().is_complete());

    Ok(())
}

/// The device user never answers; signing gives up at the link deadline.
/// The device must be scripted to delay approval past the user timeout.
pub async fn approval_deadline<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t)
        .await?
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(200));

    let session = PairingSession::new(link.clone());
    session.start().await?;
    session.confirm(true).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let (chain, mut proposal) = segwit_spend(&keystore).await?;

    let err = keystore
        .sign_transaction(&chain, &mut proposal, pending())
        .await
        .expect_err("transaction signed");
    assert!(matches!(err, Error::UserTimeout));

    Ok(())
}

/// Signing a multisig config on firmware that predates multisig support.
/// The device must be running firmware older than multisig support, and
/// the keystore client refuses the operation before it reaches the device.
pub async fn multisig_needs_firmware<T: Transport>(t: T) -> anyhow::Result<()> {
    let secp = Secp256k1::new();
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;
    assert!(!keystore.capabilities().multisig);

    let keypath = AbsoluteKeypath::from_str("m/48'/0'/0'/2'")?;
    let our_key = KeyInfo {
        root_fingerprint: keystore.root_fingerprint().await?,
        keypath: keypath.clone(),
        xpub: keystore.extended_public_key(Coin::Btc, &keypath).await?,
    };

    let cosigner_master = Xpriv::new_master(Network::Bitcoin, &[0x77; 32])?;
    let cosigner_account = cosigner_master.derive_priv(&secp, keypath.path())?;
    let cosigner_key = KeyInfo {
        root_fingerprint: cosigner_master.fingerprint(&secp),
        keypath,
        xpub: Xpub::from_priv(&secp, &cosigner_account),
    };

    let cosigner_pubkey = CompressedPublicKey(cosigner_key.xpub.public_key);
    let config = SigningConfig::multisig(1, vec![our_key, cosigner_key], 0)?;

    let account = AccountCode::from("multisig");
    let mut chain = MockChain::new();
    let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;
    chain.fund(&account, &address, Amount::from_sat(1_000_000));

    let change = config.derive_address(&secp, Coin::Btc, RelativeKeypath::change(0)?)?;
    let mut proposal = build_proposal(
        Coin::Btc,
        &utxo_map(chain.list_unspent(&account).await?),
        &[TxTarget {
            value: Amount::from_sat(600_000),
            script_pubkey: ScriptBuf::new_p2wpkh(&cosigner_pubkey.wpubkey_hash()),
        }],
        FEE_RATE,
        &change,
    )?;

    let err = keystore
        .sign_transaction(&chain, &mut proposal, pending())
        .await
        .expect_err("transaction signed");
    assert!(matches!(err, Error::StaleFirmware { .. }));

    Ok(())
}
