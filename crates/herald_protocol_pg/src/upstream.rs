//! Upstream LISTEN driver: owns the single database connection that
//! receives notifications for everybody. Reconnects with backoff, drives
//! the liveness gate, serves the dispatcher's LISTEN/UNLISTEN commands,
//! and forwards incoming notifications into the fan-out input channel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};

use crate::dispatch::{Notification, NotifyDispatcher, UpstreamCommand};
use crate::liveness::ConnectionGate;

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(250);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub struct UpstreamDriver {
    connect: String,
    gate: Arc<ConnectionGate>,
    dispatcher: Arc<NotifyDispatcher>,
    commands: mpsc::UnboundedReceiver<UpstreamCommand>,
    notifications: mpsc::Sender<Notification>,
}

impl UpstreamDriver {
    pub fn new(
        connect: &str,
        gate: Arc<ConnectionGate>,
        dispatcher: Arc<NotifyDispatcher>,
        commands: mpsc::UnboundedReceiver<UpstreamCommand>,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        Self {
            connect: format!("fallback_application_name=herald {}", connect),
            gate,
            dispatcher,
            commands,
            notifications,
        }
    }

    /// Connect-serve-reconnect forever. Only returns once the dispatcher
    /// side has gone away.
    pub async fn run(mut self) {
        let mut delay = INITIAL_RECONNECT_DELAY;
        loop {
            match tokio_postgres::connect(&self.connect, NoTls).await {
                Ok((client, connection)) => {
                    tracing::info!("Listener: connected to the database");
                    delay = INITIAL_RECONNECT_DELAY;
                    let keep_running = self.serve_connection(client, connection).await;
                    self.gate.set_disconnected();
                    if !keep_running {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!("Listener: could not connect to the database: {}", e);
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// Serve one upstream connection until it dies. Returns false when the
    /// driver should stop for good.
    async fn serve_connection(
        &mut self,
        client: Client,
        connection: Connection<Socket, NoTlsStream>,
    ) -> bool {
        // The connection must be polled for anything (including our own
        // queries) to make progress, so it gets its own task. Dropping the
        // client ends the stream and with it the task.
        let notifications = self.notifications.clone();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();
        let poller = tokio::spawn(async move {
            let _done = done_tx;
            let mut connection = connection;
            let mut messages =
                futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        herald_observability::record_notification_received();
                        let notification = Notification {
                            pid: n.process_id(),
                            channel: n.channel().to_string(),
                            payload: n.payload().to_string(),
                        };
                        if notifications.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Listener: lost connection to the database: {}", e);
                        break;
                    }
                }
            }
        });

        // Subscriptions that survived the previous connection are
        // re-established before clients learn the upstream is back.
        for channel in self.dispatcher.active_channels() {
            if let Err(e) = client.batch_execute(&listen_command(&channel)).await {
                tracing::warn!("Listener: could not re-listen on {:?}: {}", channel, e);
                drop(client);
                let _ = poller.await;
                return true;
            }
        }
        self.gate.set_connected();

        let keep_running = loop {
            tokio::select! {
                _ = &mut done_rx => break true,
                command = self.commands.recv() => match command {
                    Some(UpstreamCommand::Listen(channel)) => {
                        if let Err(e) = client.batch_execute(&listen_command(&channel)).await {
                            tracing::warn!("Listener: LISTEN {:?} failed: {}", channel, e);
                            break true;
                        }
                    }
                    Some(UpstreamCommand::Unlisten(channel)) => {
                        if let Err(e) = client.batch_execute(&unlisten_command(&channel)).await {
                            tracing::warn!("Listener: UNLISTEN {:?} failed: {}", channel, e);
                            break true;
                        }
                    }
                    None => break false,
                }
            }
        };

        drop(client);
        let _ = poller.await;
        keep_running
    }
}

fn listen_command(channel: &str) -> String {
    format!("LISTEN {}", quote_identifier(channel))
}

fn unlisten_command(channel: &str) -> String {
    format!("UNLISTEN {}", quote_identifier(channel))
}

/// Channel names come from clients; always quote them.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("foo"), "\"foo\"");
        assert_eq!(quote_identifier("Foo Bar"), "\"Foo Bar\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn listen_commands_quote_the_channel() {
        assert_eq!(listen_command("events"), "LISTEN \"events\"");
        assert_eq!(unlisten_command("x\"y"), "UNLISTEN \"x\"\"y\"");
    }

    #[test]
    fn reconnect_delays() {
        let mut delay = INITIAL_RECONNECT_DELAY;
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(delay);
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
        assert_eq!(seen[0], Duration::from_millis(250));
        assert_eq!(seen[1], Duration::from_millis(500));
        assert_eq!(*seen.last().unwrap(), MAX_RECONNECT_DELAY);
    }
}
