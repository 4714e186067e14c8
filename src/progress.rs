//! Transfer progress reporting.
//!
//! The transfer engine emits events through a [`ProgressSink`] instead of
//! touching any UI directly. The CLI renders them with indicatif; library
//! users plug in whatever they want, or [`NullSink`] for silence.

use serde::Serialize;
use tokio::sync::mpsc;

/// Paths in events are display labels: the local path or remote URI as the
/// user would write it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransferEvent {
    Start {
        src: String,
        dst: String,
        size: u64,
    },
    /// Cumulative byte offset after each chunk.
    Step {
        src: String,
        dst: String,
        current: u64,
        size: u64,
    },
    Complete {
        src: String,
        dst: String,
        size: u64,
    },
    EnterDir {
        src: String,
        dst: String,
    },
    LeaveDir {
        src: String,
        dst: String,
    },
    Fail {
        src: String,
        dst: String,
        message: String,
    },
}

pub trait ProgressSink: Send + Sync {
    fn send(&self, event: TransferEvent);
}

/// Discards every event.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn send(&self, _event: TransferEvent) {}
}

/// Forwards events to an unbounded channel; the receiving side renders them.
/// Events emitted after the receiver is dropped are discarded.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn send(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}
