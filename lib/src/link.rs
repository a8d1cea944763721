// Copyright (c) 2024-2025 The Keyfort Developers

//! Device link handle

use core::fmt;
use core::time::Duration;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time::timeout;

use keyfort_proto::{FirmwareVersion, Request, Response, Transport, PROTO_VERSION};

use crate::error::Error;
use crate::keystore::FIRMWARE_MINIMUM;

/// Default deadline for device computation
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Default deadline for exchanges blocking on user interaction
pub const USER_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared handle to a Keyfort device.
///
/// Wraps a [`Transport`] in a mutex so concurrent callers are serialized
/// into whole request/response exchanges. Clones share the underlying
/// transport and its exchange order.
pub struct DeviceLink<T: Transport> {
    t: Arc<Mutex<T>>,

    firmware: FirmwareVersion,

    request_timeout: Duration,
    user_timeout: Duration,
}

impl<T: Transport> fmt::Debug for DeviceLink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("firmware", &self.firmware)
            .field("request_timeout", &self.request_timeout)
            .field("user_timeout", &self.user_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Clone for DeviceLink<T> {
    fn clone(&self) -> Self {
        Self {
            t: self.t.clone(),
            firmware: self.firmware,
            request_timeout: self.request_timeout,
            user_timeout: self.user_timeout,
        }
    }
}

impl<T: Transport> DeviceLink<T> {
    /// Connect to a device, probing identity and firmware version.
    ///
    /// Fails with [`Error::StaleFirmware`] when the firmware predates the
    /// oldest release the host protocol supports.
    pub async fn connect(t: T) -> Result<Self, Error> {
        let t = Arc::new(Mutex::new(t));

        let resp = {
            let mut t = t.lock().await;
            let hello = t.exchange(Request::Hello {
                protocol: PROTO_VERSION,
            });

            match timeout(REQUEST_TIMEOUT, hello).await {
                Ok(r) => r.map_err(|e| Error::from(e).into_unavailable())?,
                Err(_) => return Err(Error::RequestTimeout),
            }
        };

        let firmware = match resp {
            Response::Hello { firmware } => firmware,
            Response::Error(c) => return Err(c.into()),
            _ => return Err(Error::UnexpectedResponse),
        };

        debug!("Connected to device (firmware: {})", firmware);

        if firmware < FIRMWARE_MINIMUM {
            return Err(Error::StaleFirmware {
                required: FIRMWARE_MINIMUM,
                actual: firmware,
            });
        }

        Ok(Self {
            t,
            firmware,
            request_timeout: REQUEST_TIMEOUT,
            user_timeout: USER_TIMEOUT,
        })
    }

    /// Firmware version reported by the device at connect time
    pub fn firmware(&self) -> FirmwareVersion {
        self.firmware
    }

    /// Override the default exchange deadlines
    pub fn with_timeouts(mut self, request: Duration, user: Duration) -> Self {
        self.request_timeout = request;
        self.user_timeout = user;
        self
    }

    /// Issue a request expecting a prompt device answer
    pub(crate) async fn request(&self, req: Request) -> Result<Response, Error> {
        self.exchange(req, self.request_timeout).await
    }

    /// Issue a request that blocks on user interaction on the device
    pub(crate) async fn request_user(&self, req: Request) -> Result<Response, Error> {
        match self.exchange(req, self.user_timeout).await {
            Err(Error::RequestTimeout) => Err(Error::UserTimeout),
            r => r,
        }
    }

    /// Clear an operation awaiting user confirmation, best effort
    pub(crate) async fn abandon(&self) {
        if let Err(e) = self.request(Request::Abort).await {
            warn!("Abort failed: {}", e);
        }
    }

    /// Perform one request/response exchange under the transport lock
    async fn exchange(&self, req: Request, deadline: Duration) -> Result<Response, Error> {
        debug!("Request: {}", req.opcode());

        let resp = {
            let mut t = self.t.lock().await;
            match timeout(deadline, t.exchange(req)).await {
                Ok(r) => r?,
                Err(_) => return Err(Error::RequestTimeout),
            }
        };

        match resp {
            Response::Error(c) => {
                debug!("Device error: {}", c);
                Err(c.into())
            }
            resp => Ok(resp),
        }
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use keyfort_proto::LinkError;

    use super::*;

    struct Stub {
        firmware: FirmwareVersion,
    }

    #[async_trait]
    impl Transport for Stub {
        async fn exchange(&mut self, req: Request) -> Result<Response, LinkError> {
            match req {
                Request::Hello { protocol: 1 } => Ok(Response::Hello {
                    firmware: self.firmware,
                }),
                _ => Err(LinkError::Protocol("unexpected request".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn connect_reports_firmware() {
        let link = DeviceLink::connect(Stub {
            firmware: FirmwareVersion::new(2, 4, 1),
        })
        .await
        .unwrap();

        assert_eq!(link.firmware(), FirmwareVersion::new(2, 4, 1));
        assert_eq!(link.clone().firmware(), FirmwareVersion::new(2, 4, 1));
    }

    #[tokio::test]
    async fn connect_rejects_stale_firmware() {
        let err = DeviceLink::connect(Stub {
            firmware: FirmwareVersion::new(1, 9, 9),
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::StaleFirmware { required, actual }
                if required == FIRMWARE_MINIMUM && actual == FirmwareVersion::new(1, 9, 9)
        ));
    }
}
