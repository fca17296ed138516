//! Flotilla watch broker.
//!
//! A single poll loop reads the store's watch-event log on a fixed interval
//! and fans matching events out to bounded per-subscription channels. Watches
//! starting at version 0 first replay the current objects as Added events.
//! Delivery is lossy under backpressure: a full channel drops the event.

#![forbid(unsafe_code)]

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use flotilla_core::{BundleDeployment, LabelSelector};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod broker;

pub use broker::WatchBroker;

/// Event delivered to subscribers.
pub type Event = kube::core::WatchEvent<BundleDeployment>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub poll_interval: Duration,
    /// Maximum events read from the log per subscription per tick.
    pub batch_size: usize,
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1), batch_size: 100, channel_capacity: 100 }
    }
}

/// What a subscription wants to see.
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    pub namespace: Option<String>,
    /// Start after this version; 0 replays current objects first.
    pub resource_version: i64,
    pub selector: LabelSelector,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubState {
    Initializing,
    Polling,
    Closed,
}

/// Receiving end of a watch. Dropping it or calling [`WatchStream::stop`]
/// unsubscribes.
pub struct WatchStream {
    id: u64,
    rx: mpsc::Receiver<Event>,
    token: CancellationToken,
}

impl WatchStream {
    pub(crate) fn new(id: u64, rx: mpsc::Receiver<Event>, token: CancellationToken) -> Self {
        Self { id, rx, token }
    }

    /// Subscription id, usable with [`WatchBroker::subscription_state`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Stream for WatchStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
