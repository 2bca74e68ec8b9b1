//! SENDME flow control
//!
//! Windows per circuit and per stream. The packaging side decrements a
//! send window on every outbound DATA cell and suspends cooperatively
//! when the window hits zero; a SENDME replenishes it. The delivering
//! side counts inbound DATA cells and emits a SENDME at every increment
//! boundary.
//!
//! Window values: circuit 1000/100, stream 500/50. On links with
//! protocol version >= 4, circuit-level SENDMEs are authenticated (v1):
//! they carry the running digest of the exact cell they acknowledge, and
//! unauthenticated ones are rejected.

use crate::crypto::ct_eq;
use crate::error::{Result, TorError};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Initial circuit package/deliver window
pub const CIRCUIT_WINDOW_INITIAL: i32 = 1000;

/// Circuit window increment per SENDME
pub const CIRCUIT_WINDOW_INCREMENT: i32 = 100;

/// Initial stream package/deliver window
pub const STREAM_WINDOW_INITIAL: i32 = 500;

/// Stream window increment per SENDME
pub const STREAM_WINDOW_INCREMENT: i32 = 50;

/// A send window that suspends the sender at zero
///
/// Shared between the packaging task and the circuit reactor that
/// processes incoming SENDMEs.
pub struct SendWindow {
    /// Remaining cells we may package; bounded to [0, initial]
    window: Mutex<i32>,

    /// Wakes senders blocked on an empty window
    notify: Notify,

    /// Initial (and maximum) window value
    initial: i32,

    /// Cells restored per SENDME
    increment: i32,
}

impl SendWindow {
    /// Create a window with the given initial value and increment
    pub fn new(initial: i32, increment: i32) -> Self {
        Self {
            window: Mutex::new(initial),
            notify: Notify::new(),
            initial,
            increment,
        }
    }

    /// Circuit-level window (1000 / 100)
    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW_INITIAL, CIRCUIT_WINDOW_INCREMENT)
    }

    /// Stream-level window (500 / 50)
    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW_INITIAL, STREAM_WINDOW_INCREMENT)
    }

    /// Take one send credit, suspending until one is available
    pub async fn take(&self) {
        loop {
            let notified = self.notify.notified();
            {
                let mut w = self.window.lock().expect("window lock");
                if *w > 0 {
                    *w -= 1;
                    return;
                }
            }
            notified.await;
        }
    }

    /// Take one credit without waiting; false if the window is empty
    pub fn try_take(&self) -> bool {
        let mut w = self.window.lock().expect("window lock");
        if *w > 0 {
            *w -= 1;
            true
        } else {
            false
        }
    }

    /// Process a received SENDME: restore one increment of credit
    pub fn release(&self) {
        let mut w = self.window.lock().expect("window lock");
        *w = (*w + self.increment).min(self.initial);
        drop(w);
        self.notify.notify_waiters();
    }

    /// Current credit, for health reporting
    pub fn available(&self) -> i32 {
        *self.window.lock().expect("window lock")
    }
}

/// The delivery side of a window: counts inbound DATA cells and decides
/// when to emit a SENDME
///
/// Only touched by the circuit reactor, so it stays synchronous.
#[derive(Debug)]
pub struct RecvWindow {
    /// Remaining deliver credit
    window: i32,

    /// DATA cells delivered since the last SENDME we emitted
    since_sendme: i32,

    /// Cells acknowledged per SENDME
    increment: i32,
}

impl RecvWindow {
    /// Create a deliver window
    pub fn new(initial: i32, increment: i32) -> Self {
        Self {
            window: initial,
            since_sendme: 0,
            increment,
        }
    }

    /// Circuit-level deliver window
    pub fn circuit() -> Self {
        Self::new(CIRCUIT_WINDOW_INITIAL, CIRCUIT_WINDOW_INCREMENT)
    }

    /// Stream-level deliver window
    pub fn stream() -> Self {
        Self::new(STREAM_WINDOW_INITIAL, STREAM_WINDOW_INCREMENT)
    }

    /// Account one delivered DATA cell
    ///
    /// Returns `true` when a SENDME must be emitted for this cell. A
    /// peer that overruns the window is violating the protocol.
    pub fn on_deliver(&mut self) -> Result<bool> {
        if self.window == 0 {
            return Err(TorError::LinkProtocol(
                "peer overran deliver window".into(),
            ));
        }
        self.window -= 1;
        self.since_sendme += 1;
        if self.since_sendme == self.increment {
            self.since_sendme = 0;
            self.window += self.increment;
            return Ok(true);
        }
        Ok(false)
    }

    /// Current deliver credit
    pub fn available(&self) -> i32 {
        self.window
    }
}

/// Validation state for authenticated (v1) circuit-level SENDMEs
///
/// The packaging side records a digest snapshot of every cell that sits
/// on an increment boundary; the matching SENDME must quote it.
pub struct SendmeAuth {
    /// Digests of boundary cells, oldest first
    pending: Mutex<VecDeque<[u8; 20]>>,

    /// Whether v1 SENDMEs are required (link protocol >= 4)
    required: bool,
}

impl SendmeAuth {
    /// Create validation state; `required` when the link version is >= 4
    pub fn new(required: bool) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            required,
        }
    }

    /// Record the digest snapshot of a window-boundary cell
    pub fn record(&self, digest: [u8; 20]) {
        self.pending.lock().expect("sendme lock").push_back(digest);
    }

    /// Validate an incoming circuit-level SENDME payload
    pub fn validate(&self, payload: &[u8]) -> Result<()> {
        // Legacy v0 SENDMEs have an empty payload.
        if payload.is_empty() || payload[0] == 0 {
            if self.required {
                return Err(TorError::LinkProtocol(
                    "unauthenticated SENDME on link >= 4".into(),
                ));
            }
            return Ok(());
        }

        if payload[0] != 1 {
            return Err(TorError::LinkProtocol(format!(
                "unknown SENDME version {}",
                payload[0]
            )));
        }
        if payload.len() < 3 {
            return Err(TorError::Cell("SENDME v1 payload truncated".into()));
        }
        let data_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        if data_len != 20 || payload.len() < 3 + 20 {
            return Err(TorError::Cell("SENDME v1 digest malformed".into()));
        }

        let expected = self
            .pending
            .lock()
            .expect("sendme lock")
            .pop_front()
            .ok_or_else(|| TorError::LinkProtocol("unexpected SENDME".into()))?;

        if !ct_eq(&expected, &payload[3..23]) {
            return Err(TorError::LinkProtocol("SENDME digest mismatch".into()));
        }
        Ok(())
    }
}

/// Build a v1 authenticated SENDME payload for the given digest
pub fn sendme_payload_v1(digest: &[u8; 20]) -> Vec<u8> {
    let mut out = Vec::with_capacity(23);
    out.push(1);
    out.extend_from_slice(&20u16.to_be_bytes());
    out.extend_from_slice(digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_window_take_and_release() {
        let w = SendWindow::circuit();
        assert_eq!(w.available(), 1000);

        for _ in 0..10 {
            assert!(w.try_take());
        }
        assert_eq!(w.available(), 990);

        w.release();
        assert_eq!(w.available(), 1000);

        // Releases never push the window past its initial value.
        w.release();
        assert_eq!(w.available(), 1000);
    }

    #[test]
    fn test_send_window_exhaustion_blocks() {
        let w = SendWindow::new(2, 1);
        assert!(w.try_take());
        assert!(w.try_take());
        assert!(!w.try_take());
        w.release();
        assert!(w.try_take());
    }

    #[tokio::test]
    async fn test_take_suspends_until_sendme() {
        use std::sync::Arc;

        let w = Arc::new(SendWindow::new(1, 1));
        w.take().await;

        let w2 = Arc::clone(&w);
        let waiter = tokio::spawn(async move {
            w2.take().await;
        });

        // The waiter cannot finish until credit arrives.
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        w.release();
        waiter.await.unwrap();
    }

    #[test]
    fn test_circuit_sendme_every_100_cells() {
        let mut rw = RecvWindow::circuit();
        let mut sendmes = 0;
        for _ in 0..300 {
            if rw.on_deliver().unwrap() {
                sendmes += 1;
            }
        }
        assert_eq!(sendmes, 3);
        assert_eq!(rw.available(), 1000 - 300 + 300);
    }

    #[test]
    fn test_stream_sendme_every_50_cells() {
        let mut rw = RecvWindow::stream();
        let mut boundaries = Vec::new();
        for i in 1..=100 {
            if rw.on_deliver().unwrap() {
                boundaries.push(i);
            }
        }
        assert_eq!(boundaries, vec![50, 100]);
    }

    #[test]
    fn test_deliver_overrun_is_protocol_violation() {
        let mut rw = RecvWindow::new(2, 100);
        rw.on_deliver().unwrap();
        rw.on_deliver().unwrap();
        assert!(rw.on_deliver().is_err());
    }

    #[test]
    fn test_sendme_auth_roundtrip() {
        let auth = SendmeAuth::new(true);
        let digest = [7u8; 20];
        auth.record(digest);

        let payload = sendme_payload_v1(&digest);
        assert!(auth.validate(&payload).is_ok());

        // Nothing recorded anymore: a second SENDME is unexpected.
        assert!(auth.validate(&payload).is_err());
    }

    #[test]
    fn test_unauthenticated_sendme_rejected_when_required() {
        let auth = SendmeAuth::new(true);
        assert!(auth.validate(&[]).is_err());
        assert!(auth.validate(&[0]).is_err());

        let legacy = SendmeAuth::new(false);
        assert!(legacy.validate(&[]).is_ok());
    }

    #[test]
    fn test_sendme_digest_mismatch_rejected() {
        let auth = SendmeAuth::new(true);
        auth.record([1u8; 20]);
        let payload = sendme_payload_v1(&[2u8; 20]);
        assert!(auth.validate(&payload).is_err());
    }
}
