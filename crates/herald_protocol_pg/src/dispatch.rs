//! Notification fan-out: the bridge between the single upstream
//! notification stream and the set of per-client channel subscriptions.
//!
//! Design:
//! - `NotifyDispatcher` is a shared (Arc) object holding the subscription
//!   table `channel → inboxes`.
//! - Each session subscribes its bounded inbox via `listen` and removes it
//!   via `unlisten`; the first/last subscriber of a channel triggers an
//!   upstream `LISTEN`/`UNLISTEN` through the driver command channel.
//! - A single fan-out task drains the upstream notification source and
//!   enqueues into every subscribed inbox with a strictly non-blocking
//!   send; an inbox that cannot accept a notification in that instant is
//!   skipped. Slow-consumer eviction happens at the client's own writer
//!   instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use herald_common::error::DispatchError;

/// An asynchronous notification as received from the upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend pid of the originating upstream session.
    pub pid: i32,
    pub channel: String,
    pub payload: String,
}

/// Capacity of each client's notification inbox.
pub const INBOX_CAPACITY: usize = 32;

/// Capacity of the upstream-to-dispatcher input channel.
pub const INPUT_CHANNEL_CAPACITY: usize = 4;

/// A client's notification inbox, held by the dispatcher while subscribed.
pub type Inbox = mpsc::Sender<Notification>;

/// Subscription maintenance requests forwarded to the upstream driver.
#[derive(Debug, PartialEq, Eq)]
pub enum UpstreamCommand {
    Listen(String),
    Unlisten(String),
}

struct Subscriber {
    session_id: u64,
    inbox: Inbox,
}

pub struct NotifyDispatcher {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    commands: mpsc::UnboundedSender<UpstreamCommand>,
}

impl NotifyDispatcher {
    /// Create a dispatcher and the command stream its upstream driver
    /// must serve.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<UpstreamCommand>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            channels: Mutex::new(HashMap::new()),
            commands,
        });
        (dispatcher, command_rx)
    }

    /// Subscribe `inbox` to `channel`. The first subscriber of a channel
    /// issues an upstream `LISTEN`.
    pub fn listen(
        &self,
        channel: &str,
        session_id: u64,
        inbox: &Inbox,
    ) -> Result<(), DispatchError> {
        let mut channels = self.channels.lock();
        let subscribers = channels.entry(channel.to_string()).or_default();
        if subscribers.iter().any(|s| s.session_id == session_id) {
            return Err(DispatchError::AlreadySubscribed);
        }
        let first = subscribers.is_empty();
        subscribers.push(Subscriber {
            session_id,
            inbox: inbox.clone(),
        });
        if first {
            self.commands
                .send(UpstreamCommand::Listen(channel.to_string()))
                .map_err(|_| DispatchError::Closed)?;
        }
        Ok(())
    }

    /// Remove `session_id`'s subscription from `channel`. The last removal
    /// issues an upstream `UNLISTEN`.
    pub fn unlisten(&self, channel: &str, session_id: u64) -> Result<(), DispatchError> {
        let mut channels = self.channels.lock();
        let subscribers = match channels.get_mut(channel) {
            Some(subscribers) => subscribers,
            None => return Err(DispatchError::NotSubscribed),
        };
        let pos = match subscribers.iter().position(|s| s.session_id == session_id) {
            Some(pos) => pos,
            None => return Err(DispatchError::NotSubscribed),
        };
        subscribers.swap_remove(pos);
        if subscribers.is_empty() {
            channels.remove(channel);
            self.commands
                .send(UpstreamCommand::Unlisten(channel.to_string()))
                .map_err(|_| DispatchError::Closed)?;
        }
        Ok(())
    }

    /// Channels with at least one subscriber. The upstream driver re-issues
    /// `LISTEN` for these after a reconnect.
    pub fn active_channels(&self) -> Vec<String> {
        self.channels.lock().keys().cloned().collect()
    }

    /// Spawn the single fan-out task draining the upstream source.
    pub fn spawn_fanout(self: &Arc<Self>, mut source: mpsc::Receiver<Notification>) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(notification) = source.recv().await {
                dispatcher.fan_out(&notification);
            }
        })
    }

    /// Route one notification to every subscribed inbox, skipping inboxes
    /// that cannot accept it right now ("neglect slow readers").
    fn fan_out(&self, notification: &Notification) {
        let channels = self.channels.lock();
        let subscribers = match channels.get(&notification.channel) {
            Some(subscribers) => subscribers,
            None => return,
        };
        for subscriber in subscribers {
            match subscriber.inbox.try_send(notification.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }
}
