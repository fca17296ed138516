use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use flotilla_core::{LabelSelector, RequestContext};
use flotilla_persist::{codec, EventType, RecordStore, StoreError, StoreResult, WatchEventRecord};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{BrokerConfig, Event, SubState, WatchOptions, WatchStream};

struct Subscription {
    namespace: Option<String>,
    selector: LabelSelector,
    /// Highest version already considered for this subscriber.
    watermark: i64,
    state: SubState,
    tx: mpsc::Sender<Event>,
}

/// Subscription fields copied out of the lock for one tick.
struct Pending {
    id: u64,
    namespace: Option<String>,
    selector: LabelSelector,
    watermark: i64,
    tx: mpsc::Sender<Event>,
}

struct Inner<S> {
    store: Arc<S>,
    cfg: BrokerConfig,
    subs: Mutex<FxHashMap<u64, Subscription>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Fans watch-event log entries out to subscribers. Stops when dropped.
pub struct WatchBroker<S: RecordStore> {
    inner: Arc<Inner<S>>,
}

impl<S: RecordStore> WatchBroker<S> {
    /// Start the poll loop on the current tokio runtime.
    pub fn start(store: Arc<S>, cfg: BrokerConfig) -> Self {
        let inner = Arc::new(Inner {
            store,
            cfg,
            subs: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        spawn_poll_loop(Arc::clone(&inner));
        info!(poll_ms = inner.cfg.poll_interval.as_millis() as u64, batch = inner.cfg.batch_size, "watch broker started");
        Self { inner }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.cfg
    }

    /// Register a subscription. Cancelling `ctx` or dropping the returned
    /// stream removes it.
    pub fn watch(&self, ctx: &RequestContext, opts: WatchOptions) -> WatchStream {
        let (tx, rx) = mpsc::channel(self.inner.cfg.channel_capacity.max(1));
        let token = ctx.cancel.child_token();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let replay = opts.resource_version == 0;
        let sub = Subscription {
            namespace: opts.namespace.clone().filter(|ns| !ns.is_empty()),
            selector: opts.selector.clone(),
            watermark: opts.resource_version,
            state: if replay { SubState::Initializing } else { SubState::Polling },
            tx: tx.clone(),
        };
        let namespace = sub.namespace.clone();
        let count = {
            let mut subs = self.inner.subs();
            if self.inner.shutdown.is_cancelled() {
                // Stopped broker: hand back a stream that ends immediately.
                drop(tx);
                return WatchStream::new(id, rx, token);
            }
            subs.insert(id, sub);
            subs.len()
        };
        gauge!("watch_subscribers", count as f64);
        debug!(id, namespace = ?namespace, rv = opts.resource_version, selector = %opts.selector, "watch registered");

        let monitor = Arc::clone(&self.inner);
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => monitor.remove(id),
                _ = monitor.shutdown.cancelled() => {}
            }
        });

        if replay {
            let inner = Arc::clone(&self.inner);
            let cancel = token.clone();
            tokio::spawn(async move { inner.replay(id, namespace, opts.selector, tx, cancel).await });
        }
        WatchStream::new(id, rx, token)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subs().len()
    }

    pub fn subscription_state(&self, id: u64) -> Option<SubState> {
        self.inner.subs().get(&id).map(|s| s.state)
    }

    /// Stop polling and close every subscription. Idempotent.
    pub fn stop(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let closed = {
            let mut subs = self.inner.subs();
            let n = subs.len();
            subs.clear();
            n
        };
        gauge!("watch_subscribers", 0.0);
        info!(closed, "watch broker stopped");
    }
}

impl<S: RecordStore> Drop for WatchBroker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_poll_loop<S: RecordStore>(inner: Arc<Inner<S>>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let me = Arc::clone(&inner);
                    if let Err(e) = tokio::task::spawn_blocking(move || me.tick()).await {
                        warn!(error = %e, "watch poll tick panicked");
                    }
                }
            }
        }
        debug!("watch poll loop exited");
    });
}

impl<S: RecordStore> Inner<S> {
    fn subs(&self) -> MutexGuard<'_, FxHashMap<u64, Subscription>> {
        self.subs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) {
        let count = {
            let mut subs = self.subs();
            if let Some(mut sub) = subs.remove(&id) {
                sub.state = SubState::Closed;
            }
            subs.len()
        };
        gauge!("watch_subscribers", count as f64);
        debug!(id, "watch removed");
    }

    /// Push the current objects as Added events, then switch to polling from
    /// the version the snapshot was read at.
    async fn replay(
        self: Arc<Self>,
        id: u64,
        namespace: Option<String>,
        selector: LabelSelector,
        tx: mpsc::Sender<Event>,
        cancel: CancellationToken,
    ) {
        let store = Arc::clone(&self.store);
        let ns = namespace.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.list(ns.as_deref())).await;
        let (records, rv) = match snapshot {
            Ok(Ok(v)) => v,
            Ok(Err(e)) => {
                warn!(id, error = %e, "watch replay list failed; polling from 0");
                self.promote(id, 0);
                return;
            }
            Err(e) => {
                warn!(id, error = %e, "watch replay task failed");
                self.promote(id, 0);
                return;
            }
        };
        let mut sent = 0u64;
        for rec in &records {
            let obj = match codec::decode(rec) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(id, error = %e, "skipping undecodable object in replay");
                    continue;
                }
            };
            if !selector.matches(obj.metadata.labels.as_ref()) {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.shutdown.cancelled() => return,
                res = tx.send(Event::Added(obj)) => {
                    if res.is_err() {
                        return;
                    }
                    sent += 1;
                }
            }
        }
        counter!("watch_events_sent_total", sent, "phase" => "replay");
        debug!(id, sent, rv, "watch replay complete");
        self.promote(id, rv);
    }

    fn promote(&self, id: u64, rv: i64) {
        if let Some(sub) = self.subs().get_mut(&id) {
            sub.watermark = sub.watermark.max(rv);
            sub.state = SubState::Polling;
        }
    }

    /// One poll cycle over every subscription in the Polling state.
    fn tick(&self) {
        let pending: Vec<Pending> = self
            .subs()
            .iter()
            .filter(|(_, s)| s.state == SubState::Polling)
            .map(|(id, s)| Pending {
                id: *id,
                namespace: s.namespace.clone(),
                selector: s.selector.clone(),
                watermark: s.watermark,
                tx: s.tx.clone(),
            })
            .collect();
        if pending.is_empty() {
            return;
        }
        let oldest = match self.store.oldest_event_version() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "watch poll failed; retrying next tick");
                return;
            }
        };

        let mut results = Vec::with_capacity(pending.len());
        for p in pending {
            if let Some(oldest) = oldest {
                if oldest > p.watermark + 1 {
                    warn!(id = p.id, watermark = p.watermark, oldest, "watch fell behind event retention; events were missed");
                    counter!("watch_gap_total", 1u64);
                }
            }
            match self.poll_one(&p) {
                Ok(outcome) => results.push((p.id, outcome)),
                Err(e) => warn!(id = p.id, error = %e, "watch poll failed; retrying next tick"),
            }
        }

        let mut subs = self.subs();
        for (id, (watermark, closed)) in results {
            if closed {
                if let Some(mut sub) = subs.remove(&id) {
                    sub.state = SubState::Closed;
                }
                continue;
            }
            if let Some(sub) = subs.get_mut(&id) {
                sub.watermark = sub.watermark.max(watermark);
            }
        }
    }

    /// Deliver events newer than the subscription's watermark. Returns the new
    /// watermark and whether the receiver has gone away.
    fn poll_one(&self, p: &Pending) -> StoreResult<(i64, bool)> {
        let events = self.store.events_since(p.watermark, p.namespace.as_deref(), self.cfg.batch_size)?;
        let mut watermark = p.watermark;
        let (mut sent, mut dropped) = (0u64, 0u64);
        for ev in events {
            watermark = watermark.max(ev.resource_version);
            let Some(event) = self.materialize(&ev, &p.selector) else {
                continue;
            };
            match p.tx.try_send(event) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => {
                    dropped += 1;
                    debug!(id = p.id, rv = ev.resource_version, "watch channel full; dropping event");
                }
                Err(TrySendError::Closed(_)) => return Ok((watermark, true)),
            }
        }
        if sent > 0 {
            counter!("watch_events_sent_total", sent, "phase" => "poll");
        }
        if dropped > 0 {
            counter!("watch_dropped_total", dropped);
        }
        Ok((watermark, false))
    }

    /// Turn a log entry into a typed event. `None` when the object is gone,
    /// undecodable or filtered out.
    fn materialize(&self, ev: &WatchEventRecord, selector: &LabelSelector) -> Option<Event> {
        if ev.event_type == EventType::Deleted {
            return Some(Event::Deleted(codec::deleted_stub(&ev.namespace, &ev.name, ev.resource_version)));
        }
        let obj = match self.store.get(&ev.namespace, &ev.name).and_then(|rec| codec::decode(&rec)) {
            Ok(obj) => obj,
            Err(StoreError::NotFound { .. }) => {
                debug!(ns = %ev.namespace, name = %ev.name, rv = ev.resource_version, "object gone before delivery");
                return None;
            }
            Err(e) => {
                warn!(ns = %ev.namespace, name = %ev.name, error = %e, "skipping watch event");
                return None;
            }
        };
        if !selector.matches(obj.metadata.labels.as_ref()) {
            return None;
        }
        Some(match ev.event_type {
            EventType::Added => Event::Added(obj),
            _ => Event::Modified(obj),
        })
    }
}
