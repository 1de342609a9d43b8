//! Outbound HID channel abstraction
//!
//! A DS3 Bluetooth link carries two L2CAP channels: the HID control channel
//! (enable command, rumble/LED output) and the SDP service channel used
//! during the init handshake. The session only needs to push bytes into
//! either of them, so the host link layer is hidden behind [`HidTransport`].

use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Logical channel an outbound frame is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidChannel {
    /// HID control channel
    Command,
    /// Service discovery channel
    Service,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Link closed")]
    Closed,

    #[error("Transport operation failed: {0}")]
    Operation(String),
}

/// Sink for outbound HID frames
pub trait HidTransport: Send + Sync {
    /// Queue one frame on a channel; completion is reported back to the session separately
    fn send(&self, channel: HidChannel, data: &[u8]) -> Result<(), TransportError>;
}

impl<T: HidTransport + ?Sized> HidTransport for Arc<T> {
    fn send(&self, channel: HidChannel, data: &[u8]) -> Result<(), TransportError> {
        (**self).send(channel, data)
    }
}

/// Mock transport that logs and records frames instead of sending them.
#[derive(Debug, Clone, Default)]
pub struct MockHidTransport {
    sent: Arc<Mutex<Vec<(HidChannel, Vec<u8>)>>>,
    failing: Arc<AtomicBool>,
}

impl MockHidTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames sent so far, oldest first
    pub fn sent(&self) -> Vec<(HidChannel, Vec<u8>)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Frames sent on one channel
    pub fn sent_on(&self, channel: HidChannel) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, data)| data)
            .collect()
    }

    /// Make every following send fail with [`TransportError::Closed`]
    pub fn fail_sends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }
}

impl HidTransport for MockHidTransport {
    fn send(&self, channel: HidChannel, data: &[u8]) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            info!("[MOCK HID] {:?} send failed", channel);
            return Err(TransportError::Closed);
        }

        info!("[MOCK HID] {:?} <- {} bytes", channel, data.len());
        self.sent
            .lock()
            .map_err(|_| TransportError::Operation("lock poisoned".to_string()))?
            .push((channel, data.to_vec()));
        Ok(())
    }
}
