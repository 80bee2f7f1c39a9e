//! Legal hold lifecycle.
//!
//! A hold moves `active -> released` or `active -> expired` and never back.
//! Placing one flags every matching evidence version in the store, records
//! a `hold-placed` entry in the log and mirrors the matching items into
//! escrow in the background. Releasing or expiring one clears the store flag
//! only where no other active hold still covers the item, and records a
//! `hold-released` entry. Escrow copies are left alone.
//!
//! Hold state is derived from the log: [`LegalHoldManager::open`] replays
//! the hold entries so a restart loses nothing.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::clock::{Clock, SharedClock};
use crate::error::{Error, Result, ValidationError};
use crate::log::{AppendReceipt, EntryType, LogEntry, TransparencyLog};
use crate::storage::validation::validate_identifier;
use crate::storage::{EvidenceKey, EvidenceStore, MirrorReport, ObjectMeta};

/// Review windows, in days before expiry.
pub const REVIEW_WINDOWS: [i64; 3] = [30, 60, 90];

/// Which evidence a hold covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HoldScope {
    /// One evidence item
    Evidence {
        /// Tenant id
        tenant_id: String,
        /// Asset id
        asset_id: String,
        /// Evidence id
        evidence_id: String,
    },
    /// Every item of one asset
    Asset {
        /// Tenant id
        tenant_id: String,
        /// Asset id
        asset_id: String,
    },
    /// Every item of one tenant
    Tenant {
        /// Tenant id
        tenant_id: String,
    },
}

impl HoldScope {
    /// Tenant the scope belongs to.
    pub fn tenant_id(&self) -> &str {
        match self {
            HoldScope::Evidence { tenant_id, .. }
            | HoldScope::Asset { tenant_id, .. }
            | HoldScope::Tenant { tenant_id } => tenant_id,
        }
    }

    /// Checks every identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a malformed id.
    pub fn validate(&self) -> Result<()> {
        match self {
            HoldScope::Evidence {
                tenant_id,
                asset_id,
                evidence_id,
            } => {
                EvidenceKey::new(tenant_id, asset_id, evidence_id)?;
            }
            HoldScope::Asset {
                tenant_id,
                asset_id,
            } => {
                validate_identifier("tenant id", tenant_id)?;
                validate_identifier("asset id", asset_id)?;
            }
            HoldScope::Tenant { tenant_id } => validate_identifier("tenant id", tenant_id)?,
        }
        Ok(())
    }

    /// Store prefix covering the scope.
    pub fn prefix(&self) -> String {
        match self {
            HoldScope::Evidence {
                tenant_id,
                asset_id,
                evidence_id,
            } => format!(
                "{}{evidence_id}/",
                EvidenceKey::asset_prefix(tenant_id, asset_id)
            ),
            HoldScope::Asset {
                tenant_id,
                asset_id,
            } => EvidenceKey::asset_prefix(tenant_id, asset_id),
            HoldScope::Tenant { tenant_id } => EvidenceKey::tenant_prefix(tenant_id),
        }
    }

    /// Whether `key` falls inside the scope.
    pub fn covers(&self, key: &EvidenceKey) -> bool {
        match self {
            HoldScope::Evidence {
                tenant_id,
                asset_id,
                evidence_id,
            } => {
                key.tenant_id == *tenant_id
                    && key.asset_id == *asset_id
                    && key.evidence_id == *evidence_id
            }
            HoldScope::Asset {
                tenant_id,
                asset_id,
            } => key.tenant_id == *tenant_id && key.asset_id == *asset_id,
            HoldScope::Tenant { tenant_id } => key.tenant_id == *tenant_id,
        }
    }
}

/// Lifecycle state of a hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldStatus {
    /// Blocks retention purge
    Active,
    /// Released by an operator
    Released,
    /// Passed its expiry
    Expired,
}

/// A freeze on deletion for a scope of evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalHold {
    /// Hold id
    pub id: String,
    /// Covered evidence
    pub scope: HoldScope,
    /// Why the hold was placed
    pub reason: String,
    /// Who placed it
    pub placed_by: String,
    /// When it was placed
    pub placed_at: DateTime<Utc>,
    /// Mandatory expiry
    pub expires_at: DateTime<Utc>,
    /// Current state
    pub status: HoldStatus,
    /// When it stopped being active
    pub ended_at: Option<DateTime<Utc>>,
    /// Who released it
    pub released_by: Option<String>,
    /// Why it was released
    pub release_reason: Option<String>,
    /// Leaf that recorded the placement
    pub placed_leaf: u64,
}

impl LegalHold {
    /// Whether the hold is active.
    pub fn is_active(&self) -> bool {
        self.status == HoldStatus::Active
    }
}

/// A request to place a hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceHold {
    /// Covered evidence
    pub scope: HoldScope,
    /// Why
    pub reason: String,
    /// Who
    pub placed_by: String,
    /// Mandatory expiry; `None` is rejected
    pub expires_at: Option<DateTime<Utc>>,
}

/// Payload of a `hold-placed` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldPlaced {
    /// Hold id
    pub hold_id: String,
    /// Covered evidence
    pub scope: HoldScope,
    /// Why
    pub reason: String,
    /// Who
    pub placed_by: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
    /// Items flagged at placement
    pub objects: usize,
}

/// Payload of a `hold-released` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldReleased {
    /// Hold id
    pub hold_id: String,
    /// `released` or `expired`
    pub status: HoldStatus,
    /// Why
    pub reason: String,
    /// Who
    pub released_by: String,
    /// Items whose flag was cleared
    pub objects_cleared: usize,
}

/// Holds approaching expiry, grouped by how soon.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewReport {
    /// Expiring within 30 days
    pub within_30_days: Vec<LegalHold>,
    /// Expiring in 31 to 60 days
    pub within_60_days: Vec<LegalHold>,
    /// Expiring in 61 to 90 days
    pub within_90_days: Vec<LegalHold>,
}

impl ReviewReport {
    /// Total holds needing review.
    pub fn len(&self) -> usize {
        self.within_30_days.len() + self.within_60_days.len() + self.within_90_days.len()
    }

    /// Whether nothing needs review.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one sweep collected from finished escrow mirrors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSweep {
    /// Versions copied
    pub copied: usize,
    /// Versions already in escrow
    pub skipped: usize,
    /// Items that could not be mirrored, with the reason
    pub failed: Vec<String>,
    /// Items queued for another attempt
    pub requeued: usize,
    /// Mirror tasks still running
    pub pending: usize,
}

#[derive(Debug, Default)]
struct MirrorOutcome {
    report: MirrorReport,
    failed: Vec<(EvidenceKey, String)>,
}

/// Hold state pinned for reading. See [`LegalHoldManager::coverage`].
pub struct HoldCoverage<'a>(RwLockReadGuard<'a, BTreeMap<String, LegalHold>>);

impl HoldCoverage<'_> {
    /// Whether an active hold covers `key`.
    pub fn covers(&self, key: &EvidenceKey) -> bool {
        self.0.values().any(|h| h.is_active() && h.scope.covers(key))
    }
}

/// Coordinates holds across the evidence store and the log.
pub struct LegalHoldManager {
    holds: RwLock<BTreeMap<String, LegalHold>>,
    store: Arc<EvidenceStore>,
    log: Arc<TransparencyLog>,
    clock: SharedClock,
    mirrors: Mutex<JoinSet<MirrorOutcome>>,
}

impl LegalHoldManager {
    /// Rebuilds hold state from the log's hold entries.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConsistencyViolation` if the log releases a hold it
    /// never placed, or `Error::Serialization` for an unreadable payload.
    pub fn open(
        store: Arc<EvidenceStore>,
        log: Arc<TransparencyLog>,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut events: Vec<(u64, LogEntry)> = log.entries_of_type(EntryType::HoldPlaced);
        events.extend(log.entries_of_type(EntryType::HoldReleased));
        events.sort_by_key(|(index, _)| *index);

        let mut holds = BTreeMap::new();
        for (index, entry) in events {
            match entry.entry_type {
                EntryType::HoldPlaced => {
                    let placed: HoldPlaced = entry.payload_json()?;
                    holds.insert(
                        placed.hold_id.clone(),
                        LegalHold {
                            id: placed.hold_id,
                            scope: placed.scope,
                            reason: placed.reason,
                            placed_by: placed.placed_by,
                            placed_at: entry.timestamp,
                            expires_at: placed.expires_at,
                            status: HoldStatus::Active,
                            ended_at: None,
                            released_by: None,
                            release_reason: None,
                            placed_leaf: index,
                        },
                    );
                }
                _ => {
                    let released: HoldReleased = entry.payload_json()?;
                    let hold = holds.get_mut(&released.hold_id).ok_or_else(|| {
                        Error::consistency_violation(format!(
                            "leaf {index} releases unknown hold {}",
                            released.hold_id
                        ))
                    })?;
                    hold.status = released.status;
                    hold.ended_at = Some(entry.timestamp);
                    hold.released_by = Some(released.released_by);
                    hold.release_reason = Some(released.reason);
                }
            }
        }

        if !holds.is_empty() {
            info!(holds = holds.len(), "legal holds recovered from log");
        }
        Ok(Self {
            holds: RwLock::new(holds),
            store,
            log,
            clock,
            mirrors: Mutex::new(JoinSet::new()),
        })
    }

    /// Places a hold.
    ///
    /// Validation happens before any side effect: a missing or past expiry,
    /// an empty reason or actor, or a malformed scope leave the store and
    /// the log untouched.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for a bad request, `Error::NotFound` if an
    /// evidence-scoped hold names an unknown item, or the store/log error
    /// that interrupted placement.
    pub async fn place(&self, request: PlaceHold) -> Result<LegalHold> {
        let now = self.clock.now();
        let expires_at = request.expires_at.ok_or(ValidationError::MissingExpiry)?;
        if expires_at <= now {
            return Err(ValidationError::ExpiryInPast(expires_at.to_rfc3339()).into());
        }
        if request.reason.trim().is_empty() {
            return Err(Error::invalid("hold reason must not be empty"));
        }
        if request.placed_by.trim().is_empty() {
            return Err(Error::invalid("placed_by must not be empty"));
        }
        request.scope.validate()?;

        let mut holds = self.holds.write().await;
        let keys = self.store.evidence_keys(&request.scope.prefix()).await?;
        if keys.is_empty() && matches!(request.scope, HoldScope::Evidence { .. }) {
            return Err(Error::not_found(format!(
                "evidence {}",
                request.scope.prefix().trim_end_matches('/')
            )));
        }

        let hold_id = uuid::Uuid::new_v4().to_string();
        let payload = HoldPlaced {
            hold_id: hold_id.clone(),
            scope: request.scope.clone(),
            reason: request.reason.clone(),
            placed_by: request.placed_by.clone(),
            expires_at,
            objects: keys.len(),
        };
        let entry = LogEntry::with_json(
            EntryType::HoldPlaced,
            now,
            request.scope.tenant_id(),
            &payload,
        )?;
        let receipt = self.flag_and_log(&keys, true, entry.clone()).await?;

        let hold = LegalHold {
            id: hold_id.clone(),
            scope: request.scope,
            reason: request.reason,
            placed_by: request.placed_by,
            placed_at: entry.timestamp,
            expires_at,
            status: HoldStatus::Active,
            ended_at: None,
            released_by: None,
            release_reason: None,
            placed_leaf: receipt.leaf_index,
        };
        holds.insert(hold_id, hold.clone());
        drop(holds);

        info!(
            hold_id = %hold.id,
            tenant_id = %hold.scope.tenant_id(),
            objects = keys.len(),
            expires_at = %hold.expires_at,
            leaf_index = receipt.leaf_index,
            "legal hold placed"
        );

        self.spawn_mirror(&mut *self.mirrors.lock().await, keys);

        Ok(hold)
    }

    /// Releases an active hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown hold, `Error::Validation` if
    /// it is not active or the request is incomplete.
    pub async fn release(&self, hold_id: &str, reason: &str, released_by: &str) -> Result<LegalHold> {
        if reason.trim().is_empty() || released_by.trim().is_empty() {
            return Err(Error::invalid("release requires a reason and an actor"));
        }
        let mut holds = self.holds.write().await;
        let hold = holds
            .get(hold_id)
            .ok_or_else(|| Error::not_found(format!("legal hold {hold_id}")))?;
        if !hold.is_active() {
            return Err(ValidationError::InvalidState(format!(
                "legal hold {hold_id} is {:?}, not active",
                hold.status
            ))
            .into());
        }
        self.end(&mut holds, hold_id, HoldStatus::Released, reason, released_by)
            .await
    }

    /// Ends every active hold whose expiry has passed. Expired holds stop
    /// protecting their objects; normal retention applies again.
    ///
    /// # Errors
    ///
    /// Returns the first store or log failure.
    pub async fn expire(&self) -> Result<Vec<LegalHold>> {
        let now = self.clock.now();
        let mut holds = self.holds.write().await;
        let due: Vec<String> = holds
            .values()
            .filter(|h| h.is_active() && h.expires_at <= now)
            .map(|h| h.id.clone())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for id in due {
            expired.push(
                self.end(&mut holds, &id, HoldStatus::Expired, "expiry reached", "system")
                    .await?,
            );
        }
        Ok(expired)
    }

    async fn end(
        &self,
        holds: &mut BTreeMap<String, LegalHold>,
        hold_id: &str,
        status: HoldStatus,
        reason: &str,
        actor: &str,
    ) -> Result<LegalHold> {
        let scope = holds
            .get(hold_id)
            .map(|h| h.scope.clone())
            .ok_or_else(|| Error::not_found(format!("legal hold {hold_id}")))?;

        let mut to_clear = Vec::new();
        for key in self.store.evidence_keys(&scope.prefix()).await? {
            let still_held = holds
                .values()
                .any(|other| other.id != hold_id && other.is_active() && other.scope.covers(&key));
            if !still_held {
                to_clear.push(key);
            }
        }
        let cleared = to_clear.len();

        let payload = HoldReleased {
            hold_id: hold_id.to_string(),
            status,
            reason: reason.to_string(),
            released_by: actor.to_string(),
            objects_cleared: cleared,
        };
        let entry = LogEntry::with_json(
            EntryType::HoldReleased,
            self.clock.now(),
            scope.tenant_id(),
            &payload,
        )?;
        let receipt = self.flag_and_log(&to_clear, false, entry.clone()).await?;

        let hold = holds
            .get_mut(hold_id)
            .ok_or_else(|| Error::not_found(format!("legal hold {hold_id}")))?;
        hold.status = status;
        hold.ended_at = Some(entry.timestamp);
        hold.released_by = Some(actor.to_string());
        hold.release_reason = Some(reason.to_string());

        info!(
            hold_id,
            status = ?status,
            objects_cleared = cleared,
            leaf_index = receipt.leaf_index,
            "legal hold ended"
        );
        Ok(hold.clone())
    }

    /// Sets the hold flag of every item in `keys`, then appends `entry`. If
    /// either step fails, every version is put back the way it was, so a
    /// hold change is visible in the store only once the log records it.
    async fn flag_and_log(
        &self,
        keys: &[EvidenceKey],
        on: bool,
        entry: LogEntry,
    ) -> Result<AppendReceipt> {
        let mut previous: Vec<Vec<ObjectMeta>> = Vec::with_capacity(keys.len());
        let mut applied = Ok(());
        for key in keys {
            let flipped = match self.store.legal_hold_snapshot(key).await {
                Ok(snapshot) => {
                    previous.push(snapshot);
                    self.store.set_legal_hold(key, on).await.map(|_| ())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = flipped {
                applied = Err(e);
                break;
            }
        }

        let appended = match applied {
            Ok(()) => self.log.append(entry).await,
            Err(e) => Err(e),
        };
        if appended.is_err() {
            for snapshot in &previous {
                if let Err(e) = self.store.restore_legal_hold(snapshot).await {
                    tracing::error!(
                        error = %e,
                        object = snapshot.first().map_or("", |v| v.key.as_str()),
                        "legal hold flags could not be restored"
                    );
                }
            }
        }
        appended
    }

    fn spawn_mirror(&self, mirrors: &mut JoinSet<MirrorOutcome>, keys: Vec<EvidenceKey>) {
        let store = self.store.clone();
        mirrors.spawn(async move {
            let mut outcome = MirrorOutcome::default();
            for key in keys {
                match store.mirror(&key).await {
                    Ok(report) => {
                        outcome.report.copied += report.copied;
                        outcome.report.skipped += report.skipped;
                    }
                    Err(e) => outcome.failed.push((key, e.to_string())),
                }
            }
            outcome
        });
    }

    /// Collects escrow mirrors that have finished, without waiting for the
    /// rest. Items whose mirror failed are queued again.
    pub async fn drain_mirrors(&self) -> MirrorSweep {
        let mut mirrors = self.mirrors.lock().await;
        let mut sweep = MirrorSweep::default();
        let mut retry = Vec::new();
        while let Some(joined) = mirrors.try_join_next() {
            match joined {
                Ok(outcome) => {
                    sweep.copied += outcome.report.copied;
                    sweep.skipped += outcome.report.skipped;
                    for (key, error) in outcome.failed {
                        warn!(object_key = %key.record_key(), error = %error, "escrow mirror failed, queued again");
                        sweep.failed.push(format!("{}: {error}", key.record_key()));
                        retry.push(key);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "escrow mirror task panicked");
                    sweep.failed.push(e.to_string());
                }
            }
        }
        sweep.requeued = retry.len();
        if !retry.is_empty() {
            self.spawn_mirror(&mut mirrors, retry);
        }
        sweep.pending = mirrors.len();
        sweep
    }

    /// Read access to hold state for as long as the guard lives. Placement
    /// waits for it, so a write made under the guard is either covered by a
    /// hold the guard already shows or is seen by the next placement.
    pub async fn coverage(&self) -> HoldCoverage<'_> {
        HoldCoverage(self.holds.read().await)
    }

    /// Active holds expiring within 90 days, bucketed at 30/60/90.
    pub async fn review(&self) -> ReviewReport {
        let now = self.clock.now();
        let mut report = ReviewReport::default();
        for hold in self.holds.read().await.values().filter(|h| h.is_active()) {
            let left = hold.expires_at - now;
            if left <= Duration::days(REVIEW_WINDOWS[0]) {
                report.within_30_days.push(hold.clone());
            } else if left <= Duration::days(REVIEW_WINDOWS[1]) {
                report.within_60_days.push(hold.clone());
            } else if left <= Duration::days(REVIEW_WINDOWS[2]) {
                report.within_90_days.push(hold.clone());
            }
        }
        if !report.is_empty() {
            warn!(
                within_30 = report.within_30_days.len(),
                within_60 = report.within_60_days.len(),
                within_90 = report.within_90_days.len(),
                "legal holds approaching expiry"
            );
        }
        report
    }

    /// Whether an active hold covers `key`.
    pub async fn covers(&self, key: &EvidenceKey) -> bool {
        self.coverage().await.covers(key)
    }

    /// One hold.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` for an unknown id.
    pub async fn get(&self, hold_id: &str) -> Result<LegalHold> {
        self.holds
            .read()
            .await
            .get(hold_id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("legal hold {hold_id}")))
    }

    /// Holds ordered by placement, optionally including ended ones.
    pub async fn list(&self, include_ended: bool) -> Vec<LegalHold> {
        let mut holds: Vec<LegalHold> = self
            .holds
            .read()
            .await
            .values()
            .filter(|h| include_ended || h.is_active())
            .cloned()
            .collect();
        holds.sort_by_key(|h| h.placed_leaf);
        holds
    }

    /// Waits for every pending escrow mirror and sums their reports. Failed
    /// items are logged and not retried.
    pub async fn wait_for_mirrors(&self) -> MirrorReport {
        let mut mirrors = self.mirrors.lock().await;
        let mut total = MirrorReport::default();
        while let Some(joined) = mirrors.join_next().await {
            match joined {
                Ok(outcome) => {
                    total.copied += outcome.report.copied;
                    total.skipped += outcome.report.skipped;
                    for (key, error) in outcome.failed {
                        warn!(object_key = %key.record_key(), error = %error, "escrow mirror failed");
                    }
                }
                Err(e) => warn!(error = %e, "escrow mirror task panicked"),
            }
        }
        total
    }
}
