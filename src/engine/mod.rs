mod catalog;
mod compact;
mod error;
mod holds;
mod ledger;
mod pricing;
mod queries;
mod resolver;

pub use error::EngineError;
pub use ledger::check_adjustment;
pub use pricing::{price_stay, NightPrice, PriceRequest, Quote, QuoteSegment};
pub use resolver::{rank_candidates, Allocation, Candidate, CandidateSource, ResolveRequest};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedBucketState = Arc<RwLock<BucketState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Every append already queued when the first one is received
/// joins its batch, and the batch shares a single fsync before any caller is
/// answered. Compaction and counters are handled between batches.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so partially buffered bytes don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// One organization's allocation engine: ledger, holds, catalog and pricing data.
pub struct Engine {
    pub(super) buckets: DashMap<Ulid, SharedBucketState>,
    pub(super) units: DashMap<Ulid, InventoryUnit>,
    pub(super) pools: DashMap<Ulid, InventoryPool>,
    pub(super) rate_plans: DashMap<Ulid, RatePlan>,
    /// Unit → its buckets, for candidate enumeration without a full scan.
    pub(super) unit_buckets: DashMap<Ulid, Vec<Ulid>>,
    /// Hold/booking id → bucket id.
    pub(super) hold_to_bucket: DashMap<Ulid, Ulid>,
    /// Serializes catalog writes (units, pools, rate plans). Reads never take it.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) default_hold_ttl_ms: Ms,
}

/// Apply a bucket-scoped event to its state. Caller holds the write lock and
/// has already validated the event; replay applies without validation.
pub(super) fn apply_to_bucket(bs: &mut BucketState, event: &Event, hold_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BucketCapacitySet { range, quantity, .. } => {
            for night in range.iter() {
                bs.nights.entry(night).or_default().quantity = *quantity;
            }
        }
        Event::BucketReleased { .. } => {
            bs.released = true;
        }
        Event::CountersAdjusted {
            range,
            delta_booked,
            delta_held,
            ..
        } => {
            for night in range.iter() {
                if let Some(counts) = bs.nights.get_mut(&night) {
                    counts.booked = shift(counts.booked, *delta_booked);
                    counts.held = shift(counts.held, *delta_held);
                }
            }
        }
        Event::HoldPlaced { hold } => {
            if hold.status == HoldStatus::Active {
                for night in hold.range.iter() {
                    if let Some(counts) = bs.nights.get_mut(&night) {
                        counts.held = counts.held.saturating_add(hold.quantity);
                    }
                }
            }
            hold_index.insert(hold.id, bs.spec.id);
            bs.holds.insert(hold.id, hold.clone());
        }
        Event::HoldReleased { id, expired, .. } => {
            if let Some(hold) = bs.holds.get_mut(id)
                && hold.status == HoldStatus::Active
            {
                for night in hold.range.iter() {
                    if let Some(counts) = bs.nights.get_mut(&night) {
                        counts.held = counts.held.saturating_sub(hold.quantity);
                    }
                }
                hold.status = if *expired {
                    HoldStatus::Expired
                } else {
                    HoldStatus::Released
                };
            }
        }
        Event::HoldConfirmed { id, .. } => {
            if let Some(hold) = bs.holds.get_mut(id)
                && hold.status == HoldStatus::Active
            {
                // One step: no intermediate state where the units are neither held nor booked.
                for night in hold.range.iter() {
                    if let Some(counts) = bs.nights.get_mut(&night) {
                        counts.held = counts.held.saturating_sub(hold.quantity);
                        counts.booked = counts.booked.saturating_add(hold.quantity);
                    }
                }
                hold.status = HoldStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(hold) = bs.holds.get_mut(id)
                && hold.status == HoldStatus::Confirmed
            {
                for night in hold.range.iter() {
                    if let Some(counts) = bs.nights.get_mut(&night) {
                        counts.booked = counts.booked.saturating_sub(hold.quantity);
                    }
                }
                hold.status = HoldStatus::Cancelled;
            }
        }
        // Catalog and bucket-creation events are handled at the engine level.
        Event::UnitCreated { .. }
        | Event::BucketCreated { .. }
        | Event::BucketRestored { .. }
        | Event::PoolCreated { .. }
        | Event::PoolVariantAdded { .. }
        | Event::RatePlanCreated { .. }
        | Event::RateSeasonAdded { .. }
        | Event::RateOccupancySet { .. }
        | Event::RateFeeAdded { .. } => {}
    }
}

fn shift(value: u32, delta: i64) -> u32 {
    (value as i64 + delta).clamp(0, u32::MAX as i64) as u32
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        default_hold_ttl_ms: Ms,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path, replay.valid_len)?;
        let events = replay.events;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            buckets: DashMap::new(),
            units: DashMap::new(),
            pools: DashMap::new(),
            rate_plans: DashMap::new(),
            unit_buckets: DashMap::new(),
            hold_to_bucket: DashMap::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            notify,
            clock,
            default_hold_ttl_ms,
        };

        // We are the sole owner of these Arcs during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            match event {
                Event::BucketCreated { bucket } => {
                    engine.insert_bucket(BucketState::new(bucket.clone()));
                }
                Event::BucketRestored {
                    bucket,
                    released,
                    nights,
                    holds,
                    retired,
                } => {
                    let mut bs = BucketState::new(bucket.clone());
                    bs.released = *released;
                    bs.nights = nights.iter().copied().collect();
                    for hold in holds {
                        engine.hold_to_bucket.insert(hold.id, bucket.id);
                        bs.holds.insert(hold.id, hold.clone());
                    }
                    for (id, status) in retired {
                        engine.hold_to_bucket.insert(*id, bucket.id);
                        bs.retired.insert(*id, *status);
                    }
                    engine.insert_bucket(bs);
                }
                other => match event_bucket_id(other) {
                    Some(bucket_id) => {
                        let Some(bs_arc) = engine.get_bucket(&bucket_id) else {
                            tracing::warn!(%bucket_id, "replay: event for unknown bucket skipped");
                            continue;
                        };
                        match bs_arc.try_write() {
                            Ok(mut guard) => apply_to_bucket(&mut guard, other, &engine.hold_to_bucket),
                            Err(_) => tracing::error!(%bucket_id, "replay: bucket lock contended"),
                        }
                    }
                    None => engine.apply_catalog(other),
                },
            }
        }

        tracing::debug!(
            wal = %wal_path.display(),
            events = events.len(),
            buckets = engine.buckets.len(),
            "engine replayed"
        );
        Ok(engine)
    }

    pub(super) fn insert_bucket(&self, bs: BucketState) {
        let (id, unit_id) = (bs.spec.id, bs.spec.unit_id);
        self.buckets.insert(id, Arc::new(RwLock::new(bs)));
        self.unit_buckets.entry(unit_id).or_default().push(id);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageUnavailable(e.to_string()))
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn default_hold_ttl_ms(&self) -> Ms {
        self.default_hold_ttl_ms
    }

    pub fn get_bucket(&self, id: &Ulid) -> Option<SharedBucketState> {
        self.buckets.get(id).map(|e| e.value().clone())
    }

    pub fn get_bucket_for_hold(&self, hold_id: &Ulid) -> Option<Ulid> {
        self.hold_to_bucket.get(hold_id).map(|e| *e.value())
    }

    pub(super) fn buckets_of_unit(&self, unit_id: &Ulid) -> Vec<Ulid> {
        self.unit_buckets
            .get(unit_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// WAL-append + apply + notify for a bucket-scoped event.
    pub(super) async fn persist_and_apply(
        &self,
        bs: &mut BucketState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_bucket(bs, event, &self.hold_to_bucket);
        self.notify.send(bs.spec.id, event);
        Ok(())
    }

    /// Lookup hold → bucket, acquire the bucket's write lock.
    pub(super) async fn resolve_hold_write(
        &self,
        hold_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<BucketState>), EngineError> {
        let bucket_id = self
            .get_bucket_for_hold(hold_id)
            .ok_or(EngineError::NotFound(*hold_id))?;
        let bs = self
            .get_bucket(&bucket_id)
            .ok_or(EngineError::NotFound(bucket_id))?;
        let guard = bs.write_owned().await;
        Ok((bucket_id, guard))
    }
}

/// The bucket an event mutates, for bucket-scoped events.
fn event_bucket_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::BucketCapacitySet { bucket_id, .. }
        | Event::BucketReleased { bucket_id }
        | Event::CountersAdjusted { bucket_id, .. }
        | Event::HoldReleased { bucket_id, .. }
        | Event::HoldConfirmed { bucket_id, .. }
        | Event::BookingCancelled { bucket_id, .. } => Some(*bucket_id),
        Event::HoldPlaced { hold } => Some(hold.bucket_id),
        Event::BucketCreated { bucket } | Event::BucketRestored { bucket, .. } => Some(bucket.id),
        Event::UnitCreated { .. }
        | Event::PoolCreated { .. }
        | Event::PoolVariantAdded { .. }
        | Event::RatePlanCreated { .. }
        | Event::RateSeasonAdded { .. }
        | Event::RateOccupancySet { .. }
        | Event::RateFeeAdded { .. } => None,
    }
}
