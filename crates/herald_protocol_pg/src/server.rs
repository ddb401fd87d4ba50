//! Accept loop and connection gate. Each accepted connection either
//! becomes a session (capturing the liveness signal current at accept
//! time) or, when the upstream is down, is rejected with a single FATAL
//! frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWrite;

use herald_common::config::HeraldConfig;

use crate::codec::{BackendMessage, MessageWriter};
use crate::dispatch::NotifyDispatcher;
use crate::listen::{self, Connection, Listener};
use crate::liveness::ConnectionGate;
use crate::session::FrontendSession;

pub struct ProxyServer {
    config: Arc<HeraldConfig>,
    dispatcher: Arc<NotifyDispatcher>,
    gate: Arc<ConnectionGate>,
    next_session_id: AtomicU64,
}

impl ProxyServer {
    pub fn new(
        config: Arc<HeraldConfig>,
        dispatcher: Arc<NotifyDispatcher>,
        gate: Arc<ConnectionGate>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            gate,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Accept connections forever, handing each one off to a session.
    pub async fn run(&self, listener: Listener) -> std::io::Result<()> {
        tracing::info!("herald listening on {}", self.config.listen.address());
        loop {
            let (conn, remote_addr) = listener.accept().await?;
            listen::maybe_enable_keepalive(&self.config.listen, &conn);
            self.dispatch_connection(conn, remote_addr);
        }
    }

    fn dispatch_connection(&self, conn: Connection, remote_addr: String) {
        let signal = match self.gate.capture() {
            None => {
                tokio::spawn(reject_connection(conn));
                return;
            }
            Some(signal) => signal,
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("new connection from {}", remote_addr);
        herald_observability::record_client_connected();

        let session = FrontendSession::new(
            conn,
            remote_addr,
            session_id,
            self.dispatcher.clone(),
            signal,
            self.config.clone(),
        );
        tokio::spawn(async move {
            session.run().await;
            herald_observability::record_client_disconnected();
        });
    }
}

/// Refuse a connection accepted while the upstream is down: one FATAL
/// frame, then close.
pub async fn reject_connection<S: AsyncWrite + Unpin>(stream: S) {
    let mut writer = MessageWriter::new(stream);
    let _ = writer
        .send(&BackendMessage::ErrorResponse {
            severity: "FATAL",
            code: "57A01",
            message: "no server connection available".to_string(),
        })
        .await;
    let _ = writer.flush().await;
    let _ = writer.close().await;
}
