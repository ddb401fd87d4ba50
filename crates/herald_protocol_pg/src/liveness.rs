//! Upstream-liveness coordination. While the upstream connection is up, a
//! fresh one-shot signal exists; losing the connection fires it, telling
//! every session that captured it to tear down. A later reconnect installs
//! a new signal; sessions born under the old one are not revived.

use parking_lot::Mutex;
use tokio::sync::watch;

/// A session's captured reference to the signal that was current when it
/// was accepted.
#[derive(Debug, Clone)]
pub struct LivenessSignal {
    rx: watch::Receiver<bool>,
}

impl LivenessSignal {
    /// Resolves once the upstream connection this signal tracks is lost.
    pub async fn lost(&mut self) {
        // An Err means the gate dropped the sender side, which only
        // happens once the connection is gone too.
        let _ = self.rx.wait_for(|lost| *lost).await;
    }
}

/// Process-wide connection gate, consulted briefly at each accept and on
/// each upstream state change.
pub struct ConnectionGate {
    current: Mutex<Option<watch::Sender<bool>>>,
}

impl ConnectionGate {
    /// A new gate starts disconnected; clients are rejected until the
    /// upstream driver reports a connection.
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// The upstream connection is up: install a fresh signal.
    pub fn set_connected(&self) {
        let (tx, _rx) = watch::channel(false);
        *self.current.lock() = Some(tx);
    }

    /// The upstream connection is gone: fire the current signal and leave
    /// the gate empty until the driver reconnects.
    pub fn set_disconnected(&self) {
        if let Some(tx) = self.current.lock().take() {
            let _ = tx.send(true);
        }
    }

    /// Capture the current signal, or `None` when the upstream is down.
    pub fn capture(&self) -> Option<LivenessSignal> {
        self.current
            .lock()
            .as_ref()
            .map(|tx| LivenessSignal { rx: tx.subscribe() })
    }
}

impl Default for ConnectionGate {
    fn default() -> Self {
        Self::new()
    }
}
