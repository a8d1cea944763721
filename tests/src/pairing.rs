// Copyright (c) 2024-2025 The Keyfort Developers

//! Pairing session tests

use std::time::Duration;

use log::info;

use keyfort::{DeviceLink, Error, PairingSession, PairingState, Transport};

/// Pair with a device whose user confirms the channel hash
pub async fn accept<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);

    session.start().await?;
    assert_eq!(session.state(), PairingState::HashPresented);

    let (hash, verified) = session.current_hash()?;
    info!("Channel hash: {}", hash);
    assert!(!verified);

    session.confirm(true).await?;
    assert_eq!(session.state(), PairingState::Paired);
    assert!(session.is_paired());

    Ok(())
}

/// Pairing against a device whose user rejects the channel hash
pub async fn device_rejects<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);
    session.start().await?;

    let err = session.confirm(true).await.expect_err("pairing succeeded");
    assert!(matches!(err, Error::PairingRejected));
    assert_eq!(session.state(), PairingState::Rejected);
    assert!(!session.is_paired());

    Ok(())
}

/// The user at the host rejects the channel hash
pub async fn host_rejects<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);
    session.start().await?;

    let err = session.confirm(false).await.expect_err("pairing succeeded");
    assert!(matches!(err, Error::PairingRejected));
    assert_eq!(session.state(), PairingState::Rejected);

    Ok(())
}

/// The device user never answers; the session gives up at its deadline.
/// The device must be scripted to ignore the confirmation.
pub async fn confirm_deadline<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t)
        .await?
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(500));

    let session =
        PairingSession::new(link).with_confirm_timeout(Duration::from_millis(200));
    session.start().await?;

    let err = session.confirm(true).await.expect_err("pairing succeeded");
    assert!(matches!(err, Error::PairingTimeout));
    assert_eq!(session.state(), PairingState::Unpaired);

    Ok(())
}

/// Only one confirmation may run at a time. The device must be scripted
/// to answer the confirmation after a short delay.
pub async fn concurrent_confirm<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);
    session.start().await?;

    let outcome = tokio::join!(session.confirm(true), session.confirm(true));
    match outcome {
        (Ok(()), Err(Error::PairingBusy)) | (Err(Error::PairingBusy), Ok(())) => {}
        other => anyhow::bail!("unexpected outcome: {:?}", other),
    }
    assert!(session.is_paired());

    Ok(())
}

/// A device that remembers the host reports the channel as verified, but
/// pairing still waits for the host side confirmation. The device must be
/// scripted to report a verified channel.
pub async fn preverified<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);
    session.start().await?;

    let (hash, verified) = session.current_hash()?;
    info!("Channel hash: {} (verified)", hash);
    assert!(verified);
    assert!(!session.is_paired());

    session.confirm(true).await?;
    assert!(session.is_paired());

    Ok(())
}

/// Restarting a session drops the previous pairing until reconfirmed
pub async fn restart<T: Transport>(t: T) -> anyhow::Result<()> {
    let link = DeviceLink::connect(t).await?;
    let session = PairingSession::new(link);

    session.start().await?;
    session.confirm(true).await?;
    assert!(session.is_paired());

    let first = session.current_hash()?.0;

    session.start().await?;
    assert!(!session.is_paired());
    assert_eq!(session.state(), PairingState::HashPresented);

    // Fresh nonces, fresh hash
    assert_ne!(session.current_hash()?.0, first);

    session.confirm(true).await?;
    assert!(session.is_paired());

    Ok(())
}
