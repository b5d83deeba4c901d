//! Owns the WebSocket connection, tracks which pairs are being collected,
//! and routes incoming messages into the file writer pool.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{error, info, warn};
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::file_pool::FileWriterPool;
use crate::pair::Pair;
use crate::reactive::{Observer, Subscription};
use crate::ws::{combined_stream_url, WebSocketConnection, WsDataMessage, WsEvent};

struct Tracked {
    pair: Pair,
    last_message_ts: Option<OffsetDateTime>,
}

struct State {
    currency_pairs: HashMap<String, Tracked>,
    next_id: u64,
    pending_subscribe: HashMap<u64, Pair>,
    pending_unsubscribe: HashMap<u64, Pair>,
    pending_reinstate: Vec<Pair>,
    connected: bool,
}

pub struct DataCollector {
    default_pair: Pair,
    connection: WebSocketConnection,
    file_pool: Arc<FileWriterPool>,
    state: Mutex<State>,
    message_sub: Mutex<Option<Subscription<WsDataMessage>>>,
    event_sub: Mutex<Option<Subscription<WsEvent>>>,
}

impl DataCollector {
    /// Opens one connection bootstrapped with just `default_pair`'s
    /// streams and wires its `messages`/`events` observables into this
    /// collector. No non-default pair is added yet.
    pub fn new(default_pair: Pair, file_pool: Arc<FileWriterPool>) -> Arc<Self> {
        let symbol = default_pair.symbol();
        let url = combined_stream_url(&[
            format!("{symbol}@depth@100ms"),
            format!("{symbol}@trade"),
        ]);
        let connection = WebSocketConnection::connect(url);

        let this = Arc::new(Self {
            default_pair,
            connection,
            file_pool,
            state: Mutex::new(State {
                currency_pairs: HashMap::new(),
                next_id: 1,
                pending_subscribe: HashMap::new(),
                pending_unsubscribe: HashMap::new(),
                pending_reinstate: Vec::new(),
                connected: false,
            }),
            message_sub: Mutex::new(None),
            event_sub: Mutex::new(None),
        });

        let messages_owner = this.clone();
        let message_sub = this
            .connection
            .messages()
            .subscribe(Observer::on_next(move |m: &WsDataMessage| {
                messages_owner.handle_message(m);
            }));
        let events_owner = this.clone();
        let event_sub = this
            .connection
            .events()
            .subscribe(Observer::on_next(move |e: &WsEvent| {
                events_owner.handle_event(e);
            }));
        if let Ok(mut sub) = this.message_sub.lock() {
            *sub = Some(message_sub);
        }
        if let Ok(mut sub) = this.event_sub.lock() {
            *sub = Some(event_sub);
        }

        this
    }

    pub fn is_collecting(&self, pair: &Pair) -> bool {
        if *pair == self.default_pair {
            return true;
        }
        let Ok(state) = self.state.lock() else {
            warn!("collector state lock poisoned, reporting not collecting");
            return false;
        };
        state.currency_pairs.contains_key(&pair.symbol())
    }

    pub fn get_last_message_ts(&self, pair: &Pair) -> Option<OffsetDateTime> {
        let Ok(state) = self.state.lock() else {
            warn!("collector state lock poisoned, reporting no last message");
            return None;
        };
        state
            .currency_pairs
            .get(&pair.symbol())
            .and_then(|t| t.last_message_ts)
    }

    fn subscribe_symbol(&self, state: &mut State, symbol: &str) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        self.connection.send_message(serde_json::json!({
            "method": "SUBSCRIBE",
            "params": [format!("{symbol}@trade"), format!("{symbol}@depth@100ms")],
            "id": id,
        }));
        id
    }

    fn unsubscribe_symbol(&self, state: &mut State, symbol: &str) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        self.connection.send_message(serde_json::json!({
            "method": "UNSUBSCRIBE",
            "params": [format!("{symbol}@trade"), format!("{symbol}@depth@100ms")],
            "id": id,
        }));
        id
    }

    /// Queues `pairs` for subscription, used to reinstate `ACTIVE`/`IDLE`
    /// pairs at startup. Unlike `add_currency_pair`, this never fails on
    /// `NotConnected`: if no transport is attached yet the pairs sit in
    /// `pending_reinstate` and are subscribed as soon as the first
    /// `CONNECTED` event fires, alongside any pair already being tracked.
    pub fn reinstate(&self, pairs: Vec<Pair>) {
        let Ok(mut state) = self.state.lock() else {
            warn!("collector state lock poisoned, dropping reinstate request");
            return;
        };
        if state.connected {
            for pair in pairs {
                let id = self.subscribe_symbol(&mut state, &pair.symbol());
                state.pending_subscribe.insert(id, pair);
            }
        } else {
            state.pending_reinstate.extend(pairs);
        }
    }

    /// No-op for `default_pair`. Otherwise requires the connection to
    /// already have reported CONNECTED at least once; the pair becomes
    /// fully tracked only once the matching CONTROL_MESSAGE ack arrives.
    pub fn add_currency_pair(&self, pair: Pair) -> Result<()> {
        if pair == self.default_pair {
            return Ok(());
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Poisoned("collector state lock poisoned"))?;
        if !state.connected {
            return Err(Error::NotConnected);
        }
        let id = self.subscribe_symbol(&mut state, &pair.symbol());
        state.pending_subscribe.insert(id, pair);
        Ok(())
    }

    /// No-op for `default_pair`. The pair is removed from the tracked map
    /// only once the matching CONTROL_MESSAGE ack arrives.
    pub fn remove_currency_pair(&self, pair: Pair) -> Result<()> {
        if pair == self.default_pair {
            info!("refusing to remove default currency pair");
            return Ok(());
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::Poisoned("collector state lock poisoned"))?;
        if !state.connected {
            return Err(Error::NotConnected);
        }
        let id = self.unsubscribe_symbol(&mut state, &pair.symbol());
        state.pending_unsubscribe.insert(id, pair);
        Ok(())
    }

    fn handle_message(&self, message: &WsDataMessage) {
        let pair = {
            let Ok(state) = self.state.lock() else {
                error!("collector state lock poisoned, dropping message for {}", message.symbol);
                return;
            };
            if message.symbol == self.default_pair.symbol() {
                Some(self.default_pair.clone())
            } else {
                state
                    .currency_pairs
                    .get(&message.symbol)
                    .map(|t| t.pair.clone())
            }
        };
        let Some(pair) = pair else {
            warn!("message for untracked symbol {}, dropping", message.symbol);
            return;
        };

        if let Ok(mut state) = self.state.lock() {
            if let Some(tracked) = state.currency_pairs.get_mut(&message.symbol) {
                tracked.last_message_ts = Some(OffsetDateTime::now_utc());
            }
        }

        let channel_name = message.channel.as_str();
        if let Err(e) = self.file_pool.write_data(&pair, channel_name, &message.data) {
            warn!("could not save message for {}: {e}", message.symbol);
        }
    }

    fn handle_event(&self, event: &WsEvent) {
        match event {
            WsEvent::Connected => self.resubscribe(),
            WsEvent::Disconnected => {
                if let Ok(mut state) = self.state.lock() {
                    state.connected = false;
                }
            }
            WsEvent::ControlMessage { id } => self.handle_control_message(*id),
        }
    }

    /// Resubscribes every currently tracked non-default pair with fresh
    /// correlation IDs, then subscribes anything queued by `reinstate`
    /// before this connection came up. Any pending acks accrued across
    /// the disconnect are discarded first: their acknowledgements will
    /// never arrive.
    fn resubscribe(&self) {
        let Ok(mut state) = self.state.lock() else {
            error!("collector state lock poisoned, cannot resubscribe");
            return;
        };
        state.pending_subscribe.clear();
        state.pending_unsubscribe.clear();
        state.connected = true;

        let tracked: Vec<Pair> = state
            .currency_pairs
            .values()
            .map(|t| t.pair.clone())
            .collect();
        for pair in tracked {
            let id = self.subscribe_symbol(&mut state, &pair.symbol());
            state.pending_subscribe.insert(id, pair);
        }

        let reinstated = std::mem::take(&mut state.pending_reinstate);
        for pair in reinstated {
            let id = self.subscribe_symbol(&mut state, &pair.symbol());
            state.pending_subscribe.insert(id, pair);
        }
    }

    fn handle_control_message(&self, id: u64) {
        let Ok(mut state) = self.state.lock() else {
            error!("collector state lock poisoned, dropping control message {id}");
            return;
        };
        if let Some(pair) = state.pending_subscribe.remove(&id) {
            state.currency_pairs.insert(
                pair.symbol(),
                Tracked {
                    pair,
                    last_message_ts: None,
                },
            );
        } else if let Some(pair) = state.pending_unsubscribe.remove(&id) {
            state.currency_pairs.remove(&pair.symbol());
            drop(state);
            let _ = self.file_pool.close_file(&pair, "trade");
            let _ = self.file_pool.close_file(&pair, "depth");
            return;
        } else {
            warn!("control message id {id} matched neither pending map, dropping");
        }
    }

    /// Unsubscribes both reactive subscriptions, then closes the
    /// connection. Idempotent: a second call finds both already gone.
    pub fn shutdown(&self) {
        if let Ok(mut sub) = self.message_sub.lock() {
            if let Some(mut sub) = sub.take() {
                sub.unsubscribe();
            }
        }
        if let Ok(mut sub) = self.event_sub.lock() {
            if let Some(mut sub) = sub.take() {
                sub.unsubscribe();
            }
        }
        self.connection.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(dir: &std::path::Path) -> Arc<DataCollector> {
        let pool = Arc::new(FileWriterPool::new(dir));
        DataCollector::new(Pair::new("btc", "usdt"), pool)
    }

    #[tokio::test]
    async fn default_pair_is_always_collecting() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        assert!(collector.is_collecting(&Pair::new("btc", "usdt")));
        assert!(!collector.is_collecting(&Pair::new("eth", "usdt")));
    }

    #[tokio::test]
    async fn add_currency_pair_requires_a_live_connection() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        let result = collector.add_currency_pair(Pair::new("eth", "usdt"));
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn removing_the_default_pair_is_a_no_op_ok() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        assert!(collector.remove_currency_pair(Pair::new("btc", "usdt")).is_ok());
    }

    #[tokio::test]
    async fn adding_the_default_pair_is_a_no_op_ok() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        assert!(collector.add_currency_pair(Pair::new("btc", "usdt")).is_ok());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        collector.shutdown();
        collector.shutdown();
    }

    #[tokio::test]
    async fn reinstate_before_connect_does_not_panic_or_block() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        collector.reinstate(vec![Pair::new("eth", "usdt"), Pair::new("sol", "usdt")]);
        // Queued, not yet tracked: no connection has come up in this test.
        assert!(!collector.is_collecting(&Pair::new("eth", "usdt")));
    }
}
