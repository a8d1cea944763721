// Copyright (c) 2024-2025 The Keyfort Developers

//! Device pairing flow.
//!
//! A pairing session opens with a nonce exchange from which both ends
//! derive the same [`ChannelHash`]. The user compares the hash shown by
//! host and device and confirms on both ends; only then do keystore
//! operations unlock. Rejection on either side, or a missed confirmation
//! deadline, leaves the session unusable until restarted.

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use strum::{Display, EnumIter, EnumString};
use tokio::sync::mpsc;
use tokio::time::timeout;

use keyfort_proto::{ChannelHash, Request, Response, Transport};

use crate::error::Error;
use crate::link::DeviceLink;

/// Default deadline for the two sided pairing confirmation
pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Pairing event buffer depth
const EVENT_BUFFER: usize = 4;

/// Pairing session states
#[derive(Copy, Clone, Debug, PartialEq, Display, EnumString, EnumIter)]
pub enum PairingState {
    /// No session, or the last session was torn down
    Unpaired,
    /// Nonces exchanged, channel hash awaiting user comparison
    HashPresented,
    /// Host side user confirmed the hash, device confirmation pending
    Verified,
    /// Both sides confirmed, keystore operations unlocked
    Paired,
    /// Hash rejected on the host or the device
    Rejected,
}

/// Pairing notifications delivered to the subscribed observer
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PairingEvent {
    /// Channel hash changed and should be (re)presented to the user
    HashChanged {
        /// Hash to display for comparison
        hash: ChannelHash,
        /// Whether the device already holds a verified pairing
        device_verified: bool,
    },
}

struct Inner {
    state: PairingState,
    hash: Option<ChannelHash>,
    device_verified: bool,
    events: Option<mpsc::Sender<PairingEvent>>,
}

/// Pairing session driving a device from nonce exchange to [`PairingState::Paired`].
///
/// All methods take `&self` so a session can be shared behind an [`Arc`];
/// concurrent confirmations are refused with [`Error::PairingBusy`] rather
/// than queued.
pub struct PairingSession<T: Transport> {
    link: DeviceLink<T>,

    inner: Mutex<Inner>,
    paired: Arc<AtomicBool>,
    confirming: AtomicBool,

    confirm_timeout: Duration,
}

impl<T: Transport> PairingSession<T> {
    /// Create an unpaired session over a device link
    pub fn new(link: DeviceLink<T>) -> Self {
        Self {
            link,
            inner: Mutex::new(Inner {
                state: PairingState::Unpaired,
                hash: None,
                device_verified: false,
                events: None,
            }),
            paired: Arc::new(AtomicBool::new(false)),
            confirming: AtomicBool::new(false),
            confirm_timeout: CONFIRM_TIMEOUT,
        }
    }

    /// Override the confirmation deadline
    pub fn with_confirm_timeout(mut self, deadline: Duration) -> Self {
        self.confirm_timeout = deadline;
        self
    }

    /// Current pairing state
    pub fn state(&self) -> PairingState {
        self.inner().state
    }

    /// Whether the session reached [`PairingState::Paired`]
    pub fn is_paired(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    /// Shared paired flag, observed by keystore clients
    pub(crate) fn paired_flag(&self) -> Arc<AtomicBool> {
        self.paired.clone()
    }

    /// Subscribe to pairing events.
    ///
    /// A session carries at most one observer; subscribing again replaces
    /// the previous one.
    pub fn subscribe(&self) -> mpsc::Receiver<PairingEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.inner().events = Some(tx);
        rx
    }

    /// Channel hash of the open session and whether the device already
    /// holds a verified pairing
    pub fn current_hash(&self) -> Result<(ChannelHash, bool), Error> {
        let inner = self.inner();
        match inner.hash {
            Some(hash) => Ok((hash, inner.device_verified)),
            None => Err(Error::NotPaired),
        }
    }

    /// Open a session, exchanging nonces and deriving the channel hash.
    ///
    /// Restarting an existing session discards any prior pairing and
    /// presents a fresh hash.
    pub async fn start(&self) -> Result<(), Error> {
        self.paired.store(false, Ordering::SeqCst);
        {
            let mut inner = self.inner();
            inner.state = PairingState::Unpaired;
            inner.hash = None;
            inner.device_verified = false;
        }

        let mut host_nonce = [0u8; 32];
        OsRng.fill_bytes(&mut host_nonce);

        let resp = self.link.request(Request::StartSession { host_nonce }).await?;
        let (device_nonce, verified) = match resp {
            Response::Session {
                device_nonce,
                verified,
            } => (device_nonce, verified),
            _ => return Err(Error::UnexpectedResponse),
        };

        let hash = ChannelHash::derive(&host_nonce, &device_nonce);
        debug!(
            "Session open, channel hash: {} (device verified: {})",
            hash, verified
        );

        let events = {
            let mut inner = self.inner();
            inner.state = PairingState::HashPresented;
            inner.hash = Some(hash);
            inner.device_verified = verified;
            inner.events.clone()
        };

        if let Some(events) = events {
            let event = PairingEvent::HashChanged {
                hash,
                device_verified: verified,
            };
            if let Err(e) = events.try_send(event) {
                warn!("Dropped pairing event: {}", e);
            }
        }

        Ok(())
    }

    /// Report the host side pairing decision and await the device side.
    ///
    /// Blocks until the device user answers or the confirmation deadline
    /// elapses. Only one confirmation may be in flight per session.
    pub async fn confirm(&self, accept: bool) -> Result<(), Error> {
        if self.confirming.swap(true, Ordering::SeqCst) {
            return Err(Error::PairingBusy);
        }

        let res = self.confirm_inner(accept).await;

        self.confirming.store(false, Ordering::SeqCst);

        res
    }

    async fn confirm_inner(&self, accept: bool) -> Result<(), Error> {
        match self.state() {
            PairingState::HashPresented => (),
            PairingState::Paired if accept => return Ok(()),
            _ => return Err(Error::NotPaired),
        }

        if !accept {
            debug!("Pairing rejected by host");

            // Clear the prompt on the device before giving up
            let _ = self
                .link
                .request(Request::ConfirmPairing { accept: false })
                .await;

            self.set_state(PairingState::Rejected);
            return Err(Error::PairingRejected);
        }

        self.set_state(PairingState::Verified);

        let confirm = self
            .link
            .request_user(Request::ConfirmPairing { accept: true });

        let resp = match timeout(self.confirm_timeout, confirm).await {
            Ok(r) => r,
            Err(_) => {
                debug!("Pairing confirmation timed out");
                self.link.abandon().await;
                self.set_state(PairingState::Unpaired);
                return Err(Error::PairingTimeout);
            }
        };

        let accepted = match resp {
            Ok(Response::Pairing { accepted }) => accepted,
            Ok(_) => {
                self.set_state(PairingState::Unpaired);
                return Err(Error::UnexpectedResponse);
            }
            Err(Error::UserTimeout) => {
                self.link.abandon().await;
                self.set_state(PairingState::Unpaired);
                return Err(Error::PairingTimeout);
            }
            Err(e) => {
                self.set_state(PairingState::Unpaired);
                return Err(e);
            }
        };

        if !accepted {
            debug!("Pairing rejected by device");
            self.set_state(PairingState::Rejected);
            return Err(Error::PairingRejected);
        }

        self.set_state(PairingState::Paired);
        self.paired.store(true, Ordering::SeqCst);

        Ok(())
    }

    fn set_state(&self, state: PairingState) {
        let mut inner = self.inner();
        if inner.state != state {
            debug!("Pairing state: {} -> {}", inner.state, state);
            inner.state = state;
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
