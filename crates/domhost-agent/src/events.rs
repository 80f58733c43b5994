use std::sync::Arc;

use domhost_process::{GameKey, Outbound, StdioStream};
use tokio::sync::mpsc;

use crate::game::Game;

/// Internal notifications raised by hosted games and the hosting store.
#[derive(Debug)]
pub enum HostEvent {
    /// A game entity was created or replaced.
    Registered(Arc<Game>),
    /// A game entity was deleted.
    Removed(GameKey),
    /// The process spawned and the game is online.
    Online(GameKey),
    /// The process exited; output may still be flushing.
    Exited { key: GameKey, code: Option<i32> },
    /// All output is flushed and the game is offline.
    Closed { key: GameKey, code: Option<i32> },
    Error { key: GameKey, message: String },
    Stdio {
        key: GameKey,
        stream: StdioStream,
        data: String,
    },
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

pub fn channel() -> (HostEventSender, HostEventReceiver) {
    mpsc::unbounded_channel()
}

/// Outbound surface towards the coordinator. Delivery is fire-and-forget.
pub trait Reporter: Send + Sync {
    fn emit(&self, msg: Outbound);
}

#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Reporter for ChannelReporter {
    fn emit(&self, msg: Outbound) {
        if self.tx.send(msg).is_err() {
            tracing::debug!("outbound channel closed; dropping message");
        }
    }
}
