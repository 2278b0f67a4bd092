//! Idempotency-key coordination.
//!
//! Every money-moving request carries a caller-chosen key. The coordinator
//! reserves the key with an atomic unique insert before any ledger write, so
//! at most one execution ever runs per key; retries replay the recorded
//! result instead of re-executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;

use marketpay_core::{AccountId, CustomerId, EntryId, PayoutId};

use crate::executor::OperationType;
use crate::store::{CoreStore, KeyReservation, StoreError};

/// Lifecycle of one idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Reserved; the operation is executing (or its process died mid-flight).
    Pending,
    /// Terminal: the operation committed and `result` holds its references.
    Completed,
    /// Terminal: the operation failed after reservation and `error` says why.
    Failed,
}

/// References to whatever one completed operation produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRefs {
    pub ledger_entry_ids: Vec<EntryId>,
    pub payout_id: Option<PayoutId>,
    /// "YYYY-MM" for statement rollups.
    pub statement: Option<String>,
    /// Processor-side reference, when a processor call was involved.
    pub external_id: Option<String>,
}

/// Who and what the keyed operation was about, for audit queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub account_id: AccountId,
    pub customer_id: Option<CustomerId>,
}

/// One row of the key table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub operation_type: OperationType,
    /// SHA-256 of the canonical request payload; a replay with a different
    /// payload under the same key is rejected, never silently served.
    pub request_hash: String,
    pub status: KeyStatus,
    pub correlation: CorrelationIds,
    pub result: Option<ResultRefs>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the coordinator decided about a reservation attempt.
#[derive(Debug, Clone)]
pub enum Reservation {
    /// Key was unseen; the caller now owns it and must execute.
    Fresh,
    /// Key completed before with the same payload; serve this result.
    Replayed(ResultRefs),
    /// Another holder reserved the key and has not finished.
    StillInProgress,
    /// The previous holder went silent past the lease and this caller won the
    /// takeover. It must check for already-committed side effects before
    /// re-executing.
    Abandoned,
    /// Key failed before; surface the recorded error without re-executing.
    FailedBefore { error: String },
}

#[derive(Debug, Error)]
pub enum KeyError {
    /// Same key, different payload. The caller is misusing the key.
    #[error("idempotency key reused with a different request payload")]
    KeyReuse,

    /// A terminal record cannot move to another terminal state.
    #[error("invalid key transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Canonical hash of a request payload.
///
/// `serde_json::Value` objects iterate keys in sorted order, so two payloads
/// that are semantically equal hash identically regardless of field order in
/// the caller's serialization.
pub fn request_hash(payload: &JsonValue) -> String {
    let canonical = payload.to_string();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

/// How long a pending reservation is trusted before a retry may assume its
/// holder died and take the key over.
const RESERVATION_LEASE_SECONDS: i64 = 15 * 60;

/// Coordinates the reserve / execute / record protocol over a [`CoreStore`].
#[derive(Debug, Clone)]
pub struct IdempotencyCoordinator<S> {
    store: S,
    lease: chrono::Duration,
}

impl<S: CoreStore> IdempotencyCoordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            lease: chrono::Duration::seconds(RESERVATION_LEASE_SECONDS),
        }
    }

    pub fn with_lease(mut self, lease: chrono::Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Reserve `key` for one execution.
    ///
    /// The unique insert on the key table is the mutual exclusion: of any
    /// number of concurrent callers with the same key, exactly one sees
    /// [`Reservation::Fresh`].
    pub fn reserve(
        &self,
        key: &str,
        operation_type: OperationType,
        payload: &JsonValue,
        correlation: CorrelationIds,
        now: DateTime<Utc>,
    ) -> Result<Reservation, KeyError> {
        let hash = request_hash(payload);
        let record = IdempotencyRecord {
            key: key.to_string(),
            operation_type,
            request_hash: hash.clone(),
            status: KeyStatus::Pending,
            correlation,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.reserve_key(record)? {
            KeyReservation::Inserted => Ok(Reservation::Fresh),
            KeyReservation::Existing(existing) => {
                if existing.request_hash != hash {
                    tracing::warn!(key, "idempotency key reuse with mismatched payload");
                    return Err(KeyError::KeyReuse);
                }
                match existing.status {
                    KeyStatus::Pending => {
                        // A holder that has been silent past the lease is
                        // presumed dead; exactly one retry wins the takeover.
                        let age = now.signed_duration_since(existing.updated_at);
                        if age >= self.lease
                            && self.store.claim_key(key, existing.updated_at, now)?
                        {
                            tracing::warn!(key, "adopting abandoned reservation");
                            return Ok(Reservation::Abandoned);
                        }
                        Ok(Reservation::StillInProgress)
                    }
                    KeyStatus::Completed => {
                        Ok(Reservation::Replayed(existing.result.unwrap_or_default()))
                    }
                    KeyStatus::Failed => Ok(Reservation::FailedBefore {
                        error: existing
                            .error
                            .unwrap_or_else(|| "unrecorded failure".to_string()),
                    }),
                }
            }
        }
    }

    /// Record a successful execution. Idempotent: completing an
    /// already-completed key is a no-op.
    pub fn complete(
        &self,
        key: &str,
        result: ResultRefs,
        now: DateTime<Utc>,
    ) -> Result<(), KeyError> {
        let mut record = self.load(key)?;
        match record.status {
            KeyStatus::Completed => Ok(()),
            KeyStatus::Failed => Err(KeyError::InvalidTransition(format!(
                "key {key} already failed"
            ))),
            KeyStatus::Pending => {
                record.status = KeyStatus::Completed;
                record.result = Some(result);
                record.updated_at = now;
                self.store.update_key(record)?;
                Ok(())
            }
        }
    }

    /// Record a failed execution. Idempotent for an already-failed key.
    pub fn fail(&self, key: &str, error: String, now: DateTime<Utc>) -> Result<(), KeyError> {
        let mut record = self.load(key)?;
        match record.status {
            KeyStatus::Failed => Ok(()),
            KeyStatus::Completed => Err(KeyError::InvalidTransition(format!(
                "key {key} already completed"
            ))),
            KeyStatus::Pending => {
                record.status = KeyStatus::Failed;
                record.error = Some(error);
                record.updated_at = now;
                self.store.update_key(record)?;
                Ok(())
            }
        }
    }

    /// Drop a pending reservation after an infrastructure failure.
    ///
    /// Nothing was committed, so the same key stays usable once the store
    /// recovers. Terminal keys are never released.
    pub fn release(&self, key: &str) -> Result<(), KeyError> {
        let record = self.load(key)?;
        match record.status {
            KeyStatus::Pending => Ok(self.store.remove_key(key)?),
            KeyStatus::Completed | KeyStatus::Failed => Err(KeyError::InvalidTransition(
                format!("key {key} is terminal"),
            )),
        }
    }

    pub fn record(&self, key: &str) -> Result<Option<IdempotencyRecord>, KeyError> {
        Ok(self.store.key(key)?)
    }

    fn load(&self, key: &str) -> Result<IdempotencyRecord, KeyError> {
        self.store
            .key(key)?
            .ok_or_else(|| StoreError::NotFound(format!("idempotency key {key}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn correlation() -> CorrelationIds {
        CorrelationIds {
            account_id: AccountId::new(),
            customer_id: None,
        }
    }

    #[test]
    fn first_reservation_is_fresh_then_in_progress() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({"amount": 10_000});
        let now = Utc::now();

        let first = coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        assert!(matches!(first, Reservation::Fresh));

        let second = coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        assert!(matches!(second, Reservation::StillInProgress));
    }

    #[test]
    fn completed_key_replays_recorded_result() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({"amount": 10_000});
        let now = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        let refs = ResultRefs {
            ledger_entry_ids: vec![EntryId::new()],
            ..ResultRefs::default()
        };
        coordinator.complete("op-1", refs.clone(), now).unwrap();

        match coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap()
        {
            Reservation::Replayed(replayed) => assert_eq!(replayed, refs),
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn payload_mismatch_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let now = Utc::now();

        coordinator
            .reserve(
                "op-1",
                OperationType::Charge,
                &json!({"amount": 10_000}),
                correlation(),
                now,
            )
            .unwrap();

        let err = coordinator
            .reserve(
                "op-1",
                OperationType::Charge,
                &json!({"amount": 99}),
                correlation(),
                now,
            )
            .unwrap_err();
        assert!(matches!(err, KeyError::KeyReuse));
    }

    #[test]
    fn failed_key_surfaces_recorded_error() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({"amount": 1});
        let now = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Payout, &payload, correlation(), now)
            .unwrap();
        coordinator
            .fail("op-1", "insufficient funds".to_string(), now)
            .unwrap();

        match coordinator
            .reserve("op-1", OperationType::Payout, &payload, correlation(), now)
            .unwrap()
        {
            Reservation::FailedBefore { error } => assert_eq!(error, "insufficient funds"),
            other => panic!("expected failed-before, got {other:?}"),
        }
    }

    #[test]
    fn terminal_states_do_not_cross() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({});
        let now = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Adjustment, &payload, correlation(), now)
            .unwrap();
        coordinator.fail("op-1", "boom".to_string(), now).unwrap();

        // Failed stays failed.
        assert!(coordinator.fail("op-1", "again".to_string(), now).is_ok());
        assert!(matches!(
            coordinator.complete("op-1", ResultRefs::default(), now),
            Err(KeyError::InvalidTransition(_))
        ));
    }

    #[test]
    fn released_key_can_be_reserved_again() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({"amount": 10_000});
        let now = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        coordinator.release("op-1").unwrap();

        let retry = coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        assert!(matches!(retry, Reservation::Fresh));
    }

    #[test]
    fn terminal_keys_cannot_be_released() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({});
        let now = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), now)
            .unwrap();
        coordinator
            .complete("op-1", ResultRefs::default(), now)
            .unwrap();
        assert!(matches!(
            coordinator.release("op-1"),
            Err(KeyError::InvalidTransition(_))
        ));
    }

    #[test]
    fn stale_pending_reservation_is_adopted_once() {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = IdempotencyCoordinator::new(store);
        let payload = json!({"amount": 10_000});
        let t0 = Utc::now();

        coordinator
            .reserve("op-1", OperationType::Charge, &payload, correlation(), t0)
            .unwrap();

        // Within the lease the key stays in progress.
        let soon = t0 + chrono::Duration::minutes(1);
        assert!(matches!(
            coordinator
                .reserve("op-1", OperationType::Charge, &payload, correlation(), soon)
                .unwrap(),
            Reservation::StillInProgress
        ));

        // Past the lease the retry takes the key over, and the takeover
        // refreshes the lease so a second retry does not also win.
        let later = t0 + chrono::Duration::hours(1);
        assert!(matches!(
            coordinator
                .reserve("op-1", OperationType::Charge, &payload, correlation(), later)
                .unwrap(),
            Reservation::Abandoned
        ));
        assert!(matches!(
            coordinator
                .reserve("op-1", OperationType::Charge, &payload, correlation(), later)
                .unwrap(),
            Reservation::StillInProgress
        ));
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let a = json!({"amount": 5, "currency": "usd"});
        let b = json!({"currency": "usd", "amount": 5});
        assert_eq!(request_hash(&a), request_hash(&b));
    }
}
