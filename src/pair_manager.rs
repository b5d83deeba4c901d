//! Periodic worker: queries the exchange catalogue, reconciles the
//! repository against it, drives pair lifecycle transitions, and triggers
//! the (pluggable, currently no-op) snapshot hook. The refresh counter
//! always resets after an attempt, whether or not the catalogue query
//! succeeded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info, warn};
use time::OffsetDateTime;

use crate::collector::DataCollector;
use crate::exchange::ExchangeClient;
use crate::pair::{Pair, PairChange, PairStatus};
use crate::repository::Repository;

const TICK: Duration = Duration::from_secs(5);
const REFRESH_PERIOD_S: u64 = 60;
const IDLE_THRESHOLD: Duration = Duration::from_secs(5 * 60);

struct LastActivity {
    update_dt: Option<OffsetDateTime>,
    change_dt: Option<OffsetDateTime>,
    change: Option<PairChange>,
}

pub struct PairManager {
    repository: Arc<Repository>,
    collector: Arc<DataCollector>,
    exchange: ExchangeClient,
    cache: Mutex<HashMap<String, Pair>>,
    snapshot_period_s: u64,
    stopped: Arc<AtomicBool>,
    activity: Mutex<LastActivity>,
}

impl PairManager {
    /// Loads all pairs from the repository, reinstates `ACTIVE`/`IDLE`
    /// ones into the data collector, and caches the set by symbol.
    pub fn new(
        repository: Arc<Repository>,
        collector: Arc<DataCollector>,
        exchange: ExchangeClient,
        snapshot_period_s: u64,
    ) -> Arc<Self> {
        let pairs = repository.find(&Default::default());
        let mut cache = HashMap::new();
        let mut to_reinstate = Vec::new();
        for pair in pairs {
            if matches!(pair.status, PairStatus::Active | PairStatus::Idle) {
                to_reinstate.push(pair.clone());
            }
            cache.insert(pair.symbol(), pair);
        }
        // `collector`'s connection is opened asynchronously and may still be
        // mid-handshake here, so `reinstate` queues these rather than
        // subscribing immediately: it drains the queue itself once the
        // connection reports CONNECTED.
        collector.reinstate(to_reinstate);

        Arc::new(Self {
            repository,
            collector,
            exchange,
            cache: Mutex::new(cache),
            snapshot_period_s,
            stopped: Arc::new(AtomicBool::new(false)),
            activity: Mutex::new(LastActivity {
                update_dt: None,
                change_dt: None,
                change: None,
            }),
        })
    }

    pub fn last_update_dt(&self) -> Option<OffsetDateTime> {
        self.activity.lock().ok()?.update_dt
    }

    pub fn last_change_dt(&self) -> Option<OffsetDateTime> {
        self.activity.lock().ok()?.change_dt
    }

    pub fn last_change(&self) -> Option<PairChange> {
        self.activity.lock().ok()?.change.clone()
    }

    fn is_idle(&self, pair: &Pair) -> bool {
        match self.collector.get_last_message_ts(pair) {
            Some(ts) => OffsetDateTime::now_utc() - ts > IDLE_THRESHOLD,
            None => false,
        }
    }

    /// Runs one reconciliation pass against the exchange catalogue.
    /// Exposed directly (rather than only via `run`'s tick loop) so
    /// callers can trigger a refresh on demand, and so tests can drive it
    /// deterministically instead of waiting on the 60-second counter.
    pub async fn refresh(&self) {
        let fetched = match self.exchange.fetch_catalogue().await {
            Ok(pairs) => pairs,
            Err(e) => {
                error!("could not query exchange catalogue: {e}");
                return;
            }
        };
        let new_pairs: HashMap<String, Pair> =
            fetched.into_iter().map(|p| (p.symbol(), p)).collect();

        let Ok(mut cache) = self.cache.lock() else {
            error!("pair cache lock poisoned, skipping refresh");
            return;
        };
        let mut added = std::collections::HashSet::new();
        let mut removed = std::collections::HashSet::new();

        let old_symbols: Vec<String> = cache.keys().cloned().collect();
        for symbol in old_symbols {
            let value = cache.get(&symbol).unwrap().clone();
            if !new_pairs.contains_key(&symbol) {
                let mut archived = value.clone();
                archived.status = PairStatus::Archived;
                if let Err(e) = self.repository.update(archived.uuid, archived.clone()) {
                    warn!("could not archive pair {symbol}: {e}");
                }
                if let Err(e) = self.collector.remove_currency_pair(value.clone()) {
                    warn!("could not stop collecting archived pair {symbol}: {e}");
                }
                removed.insert(value);
                cache.insert(symbol.clone(), archived);
            } else if self.is_idle(&value) {
                let mut idle = value.clone();
                idle.status = PairStatus::Idle;
                if let Err(e) = self.repository.update(idle.uuid, idle.clone()) {
                    warn!("could not mark pair {symbol} idle: {e}");
                }
                cache.insert(symbol, idle);
            }
        }

        for (symbol, value) in new_pairs {
            match cache.get(&symbol) {
                None => {
                    match self.repository.create(value.clone()) {
                        Ok(created) => {
                            added.insert(created.clone());
                            cache.insert(symbol, created);
                        }
                        Err(e) => warn!("could not create pair {symbol}: {e}"),
                    }
                }
                Some(existing) if existing.status == PairStatus::Archived => {
                    let mut restored = existing.clone();
                    restored.status = PairStatus::Restored;
                    if let Err(e) = self.repository.update(restored.uuid, restored.clone()) {
                        warn!("could not restore pair {symbol}: {e}");
                    }
                    added.insert(restored.clone());
                    cache.insert(symbol, restored);
                }
                Some(_) => {}
            }
        }
        drop(cache);

        let Ok(mut activity) = self.activity.lock() else {
            error!("pair activity lock poisoned, refresh result not recorded");
            return;
        };
        activity.update_dt = Some(OffsetDateTime::now_utc());
        if !added.is_empty() || !removed.is_empty() {
            activity.change_dt = Some(OffsetDateTime::now_utc());
            activity.change = Some(PairChange { added, removed });
        }
    }

    /// Snapshot hook; a no-op in this engine, present so external
    /// snapshot logic can be plugged in without changing the tick loop.
    fn snapshot(&self) {
        info!("snapshot tick (no-op)");
    }

    /// Runs the 5-second tick loop until `stopped` is set. Intended to be
    /// spawned on its own task/thread; REST failures are logged and never
    /// propagate out of the loop.
    pub async fn run(self: Arc<Self>) {
        let refresh_counter_start = REFRESH_PERIOD_S / TICK.as_secs();
        let snapshot_counter_start = self.snapshot_period_s / TICK.as_secs();

        let mut refresh_counter = 0u64;
        let mut snapshot_counter = 0u64;

        while !self.stopped.load(Ordering::Relaxed) {
            if refresh_counter == 0 {
                self.refresh().await;
                refresh_counter = refresh_counter_start;
            }
            if snapshot_counter == 0 {
                self.snapshot();
                snapshot_counter = snapshot_counter_start;
            }
            refresh_counter -= 1;
            snapshot_counter -= 1;

            tokio::time::sleep(TICK).await;
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}
