// Copyright (c) 2024-2025 The Keyfort Developers

//! Keystore query tests

use std::str::FromStr;

use bitcoin::secp256k1::Secp256k1;
use log::info;

use keyfort::proto::{AbsoluteKeypath, Coin, RelativeKeypath, ScriptType};
use keyfort::{
    AccountAddress, DeviceLink, Error, KeyInfo, KeystoreClient, PairingSession, SigningConfig,
    Transport,
};

/// Extended public key reported for the test seed at `m/84'/1'/0'`
pub const TESTNET_SEGWIT_XPUB: &str = "xpub6CAkM5q77qFTdrsoqguwTxAnnPVRd4hyHntZaYr9FTcefWi3AaTevG1YTvWzkNuqtshjQnJxpw1YjKLtuQvfvDiDiLVx2XYKZW5baGsRUuC";

/// Fetch the root fingerprint and an account xpub, checking both against
/// the test seed
pub async fn queries<T: Transport>(t: T) -> anyhow::Result<()> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let fingerprint = keystore.root_fingerprint().await?;
    info!("Root fingerprint: {}", fingerprint);
    assert_eq!(fingerprint.to_string(), crate::ROOT_FINGERPRINT);

    let keypath = AbsoluteKeypath::from_str("m/84'/1'/0'")?;
    let xpub = keystore.extended_public_key(Coin::Tbtc, &keypath).await?;
    assert_eq!(xpub.to_string(), TESTNET_SEGWIT_XPUB);

    Ok(())
}

/// Queries require a paired session
pub async fn requires_pairing<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link.clone());

    let err = KeystoreClient::new(link, &session).expect_err("client created");
    assert!(matches!(err, Error::NotPaired));

    Ok(())
}

async fn segwit_receive_address<T: Transport>(
    keystore: &KeystoreClient<T>,
    index: u32,
) -> anyhow::Result<AccountAddress> {
    let keypath = AbsoluteKeypath::from_str("m/84'/0'/0'")?;
    let config = SigningConfig::simple(
        ScriptType::P2wpkh,
        KeyInfo {
            root_fingerprint: keystore.root_fingerprint().await?,
            keypath: keypath.clone(),
            xpub: keystore.extended_public_key(Coin::Btc, &keypath).await?,
        },
    )?;

    let secp = Secp256k1::new();
    Ok(config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(index)?)?)
}

/// Show a receive address on the device, returning the host derivation
/// so the caller can compare it with the device screen
pub async fn show_address<T: Transport>(t: T) -> anyhow::Result<String> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let address = segwit_receive_address(&keystore, 3).await?;
    keystore.display_address(Coin::Btc, &address).await?;

    info!("Confirmed address {}", address.address());
    Ok(address.address().to_string())
}

/// Address display fails when the device user rejects it. The device must
/// be scripted to reject approvals.
pub async fn show_address_rejected<T: Transport>(t: T) -> anyhow::Result<()> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;

    let address = segwit_receive_address(&keystore, 3).await?;
    let err = keystore
        .display_address(Coin::Btc, &address)
        .await
        .expect_err("address confirmed");
    assert!(matches!(err, Error::UserAborted));

    Ok(())
}

/// Taproot operations are refused against firmware that predates them.
/// The device must be running firmware older than taproot support.
pub async fn stale_firmware<T: Transport>(t: T) -> anyhow::Result<()> {
    let (link, session) = crate::pair(t).await?;
    let keystore = KeystoreClient::new(link, &session)?;
    assert!(!keystore.capabilities().taproot);

    let keypath = AbsoluteKeypath::from_str("m/86'/0'/0'")?;
    let config = SigningConfig::simple(
        ScriptType::P2tr,
        KeyInfo {
            root_fingerprint: keystore.root_fingerprint().await?,
            keypath: keypath.clone(),
            xpub: keystore.extended_public_key(Coin::Btc, &keypath).await?,
        },
    )?;

    let secp = Secp256k1::new();
    let address = config.derive_address(&secp, Coin::Btc, RelativeKeypath::receive(0)?)?;

    let err = keystore
        .display_address(Coin::Btc, &address)
        .await
        .expect_err("address displayed");
    assert!(matches!(err, Error::StaleFirmware { .. }));

    Ok(())
}
