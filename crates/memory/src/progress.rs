//! Per-request progress reporting.
//!
//! The pipeline never prints or consults global debug state; callers that
//! want live output pass a [`ProgressSink`] into the request.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::decision::IntentKind;
use crate::schema::HistoryEvent;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum ProgressEvent {
    FactsExtracted { count: usize },
    FactSearched { ordinal: usize, neighbours: usize },
    IntentsDecided { count: usize },
    MutationApplied { memory_id: String, event: HistoryEvent },
    IntentSkipped { index: usize, kind: IntentKind, reason: String },
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events to an unbounded channel.  A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelProgress {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelProgress {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}
