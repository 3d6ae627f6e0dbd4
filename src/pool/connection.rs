//! A single pooled WebSocket connection: reconnect state machine,
//! exponential backoff, subscription replay on open.
//!
//! Grounded on the teacher's `collector::runner::run_ws_loop` (connect
//! → subscribe → read loop → on error, fall through to a retry delay)
//! generalized from the teacher's fixed 5s retry to the exponential
//! `min(30s, 1s·2^k)` schedule spec.md §4.1 mandates, plus the
//! `Failed` terminal state the teacher never needed.

use crate::hl_wire::{self, HlChannel};
use crate::metrics::METRICS;
use crate::schema::{Address, SubscriptionEvent};
use dashmap::DashSet;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Backoff(u32),
    Failed,
    Closed,
}

const MAX_BACKOFF_ATTEMPT: u32 = 10;

fn backoff_delay(k: u32) -> Duration {
    let secs = 1u64.checked_shl(k.min(MAX_BACKOFF_ATTEMPT)).unwrap_or(u64::MAX);
    Duration::from_secs(secs.min(30))
}

enum ConnCommand {
    Subscribe(Address),
    Unsubscribe(Address),
    Shutdown,
}

/// A handle the pool holds for one connection. The connection's own
/// background task owns the socket; this handle only exposes the
/// cheap-to-read subscription count used for placement decisions and a
/// command channel for subscribe/unsubscribe/shutdown.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    subscription_count: AtomicUsize,
    owned: DashSet<Address>,
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    state: Arc<StdRwLock<ConnectionState>>,
}

impl ConnectionHandle {
    pub fn subscription_count(&self) -> usize {
        self.subscription_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().expect("lock not poisoned")
    }

    pub fn owns(&self, address: &Address) -> bool {
        self.owned.contains(address)
    }

    pub fn subscribe(&self, address: Address) {
        if self.owned.insert(address.clone()) {
            self.subscription_count.fetch_add(1, Ordering::Relaxed);
        }
        let _ = self.cmd_tx.send(ConnCommand::Subscribe(address));
    }

    pub fn unsubscribe(&self, address: &Address) {
        if self.owned.remove(address).is_some() {
            self.subscription_count.fetch_sub(1, Ordering::Relaxed);
        }
        let _ = self.cmd_tx.send(ConnCommand::Unsubscribe(address.clone()));
    }

    /// Every address currently routed through this connection — used
    /// by the pool to relocate subscriptions when the connection fails.
    pub fn owned_addresses(&self) -> Vec<Address> {
        self.owned.iter().map(|a| a.clone()).collect()
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ConnCommand::Shutdown);
    }
}

/// Spawns the background task for connection `id` and returns its handle.
///
/// `on_event` is awaited with `(address, event)` for every message the
/// connection receives, in receipt order; there is no ordering
/// guarantee across connections (spec.md §4.1 "Ordering"). Awaiting it
/// inline (rather than spawning) is what lets the message queue's
/// synchronous fallback push backpressure onto this read loop.
///
/// `on_failed` is called once, when the connection exhausts its retry
/// budget, so the pool can relocate its subscriptions elsewhere.
pub fn spawn_connection(
    id: ConnectionId,
    ws_url: String,
    on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync>,
    on_failed: Arc<dyn Fn(ConnectionId, Vec<Address>) + Send + Sync>,
    cancel: CancellationToken,
) -> Arc<ConnectionHandle> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StdRwLock::new(ConnectionState::Connecting));

    let handle = Arc::new(ConnectionHandle {
        id,
        subscription_count: AtomicUsize::new(0),
        owned: DashSet::new(),
        cmd_tx,
        state: state.clone(),
    });

    tokio::spawn(run_connection(id, ws_url, cmd_rx, state, on_event, on_failed, cancel));

    handle
}

async fn run_connection(
    id: ConnectionId,
    ws_url: String,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
    state: Arc<StdRwLock<ConnectionState>>,
    on_event: Arc<dyn Fn(Address, SubscriptionEvent) -> BoxFuture<'static, ()> + Send + Sync>,
    on_failed: Arc<dyn Fn(ConnectionId, Vec<Address>) + Send + Sync>,
    cancel: CancellationToken,
) {
    let mut owned: Vec<Address> = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            *state.write().expect("lock not poisoned") = ConnectionState::Closed;
            return;
        }

        *state.write().expect("lock not poisoned") = ConnectionState::Connecting;

        match connect_async(&ws_url).await {
            Ok((ws, _)) => {
                attempt = 0;
                *state.write().expect("lock not poisoned") = ConnectionState::Open;
                METRICS.connections_active.inc();
                tracing::info!(connection_id = id, "connection open");

                let (mut write, mut read) = ws.split();

                // Replay every subscription this connection owns on open
                // (spec.md §4.1: "the wrapper replays all subscription
                // frames it owns" — the remote treats duplicate
                // subscribes idempotently, so no local dedup is needed
                // beyond `owned` already being a set).
                for addr in &owned {
                    let _ = write
                        .send(Message::Text(hl_wire::build_subscribe_frame(HlChannel::UserFills, addr).to_string().into()))
                        .await;
                    let _ = write
                        .send(Message::Text(hl_wire::build_subscribe_frame(HlChannel::OrderUpdates, addr).to_string().into()))
                        .await;
                }

                let closed_reason = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = write.send(Message::Close(None)).await;
                            break None;
                        }
                        cmd = cmd_rx.recv() => {
                            match cmd {
                                Some(ConnCommand::Subscribe(addr)) => {
                                    if !owned.contains(&addr) {
                                        owned.push(addr.clone());
                                    }
                                    let _ = write.send(Message::Text(hl_wire::build_subscribe_frame(HlChannel::UserFills, &addr).to_string().into())).await;
                                    let _ = write.send(Message::Text(hl_wire::build_subscribe_frame(HlChannel::OrderUpdates, &addr).to_string().into())).await;
                                }
                                Some(ConnCommand::Unsubscribe(addr)) => {
                                    owned.retain(|a| a != &addr);
                                    let _ = write.send(Message::Text(hl_wire::build_unsubscribe_frame(HlChannel::UserFills, &addr).to_string().into())).await;
                                    let _ = write.send(Message::Text(hl_wire::build_unsubscribe_frame(HlChannel::OrderUpdates, &addr).to_string().into())).await;
                                }
                                Some(ConnCommand::Shutdown) | None => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break None;
                                }
                            }
                        }
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    match hl_wire::parse_message(&text) {
                                        Ok(Some((address, event))) => {
                                            METRICS.events_processed.inc();
                                            on_event(address, event).await;
                                        }
                                        Ok(None) => {}
                                        Err(e) => {
                                            METRICS.events_malformed.inc();
                                            tracing::warn!(connection_id = id, error = %e, "dropping malformed event");
                                        }
                                    }
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    let _ = write.send(Message::Pong(data)).await;
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    break Some("remote closed connection");
                                }
                                Some(Err(e)) => {
                                    break Some(Box::leak(e.to_string().into_boxed_str()));
                                }
                                _ => {}
                            }
                        }
                    }
                };

                METRICS.connections_active.dec();

                match closed_reason {
                    None => {
                        // explicit shutdown or cancellation: terminal
                        *state.write().expect("lock not poisoned") = ConnectionState::Closed;
                        return;
                    }
                    Some(reason) => {
                        tracing::warn!(connection_id = id, reason, "connection lost, reconnecting");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = id, error = %e, "connect failed");
            }
        }

        // drain any subscribe/unsubscribe commands queued while down,
        // so `owned` stays accurate for the next replay.
        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                ConnCommand::Subscribe(addr) => {
                    if !owned.contains(&addr) {
                        owned.push(addr);
                    }
                }
                ConnCommand::Unsubscribe(addr) => owned.retain(|a| a != &addr),
                ConnCommand::Shutdown => {
                    *state.write().expect("lock not poisoned") = ConnectionState::Closed;
                    return;
                }
            }
        }

        attempt += 1;
        METRICS.ws_reconnects.inc();

        if attempt > MAX_BACKOFF_ATTEMPT {
            *state.write().expect("lock not poisoned") = ConnectionState::Failed;
            METRICS.connections_failed.inc();
            tracing::error!(connection_id = id, "connection failed permanently, relocating subscriptions");
            on_failed(id, owned.clone());
            return;
        }

        let delay = backoff_delay(attempt - 1);
        *state.write().expect("lock not poisoned") = ConnectionState::Backoff(attempt);
        tokio::select! {
            _ = cancel.cancelled() => {
                *state.write().expect("lock not poisoned") = ConnectionState::Closed;
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(16));
        assert_eq!(backoff_delay(5), Duration::from_secs(30)); // 32 capped to 30
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }
}
