//! Infrastructure layer: stores, the idempotency coordinator, the balance
//! materializer, the transactional operation executor, the settlement
//! scheduler drivers, and the service facade.

pub mod executor;
pub mod idempotency;
pub mod materializer;
pub mod processor;
pub mod scheduler;
pub mod service;
pub mod store;


pub use executor::{OpError, OperationExecutor, OperationRequest, OperationType};
pub use idempotency::{
    CorrelationIds, IdempotencyCoordinator, IdempotencyRecord, KeyError, KeyStatus, Reservation,
    ResultRefs,
};
pub use materializer::{BalanceMaterializer, ReconciliationReport};
pub use processor::{
    MockMode, MockProcessor, PaymentProcessor, ProcessorError, ProcessorReceipt, ProcessorStatus,
};
pub use scheduler::{
    BillingDriver, DriverReport, PayoutSweepDriver, ReconciliationDriver, StatementDriver,
    WorkerHandle, spawn_periodic,
};
pub use service::{BalanceView, CoreError, OperationOutcome, PaymentsCore};
pub use store::{CoreStore, InMemoryStore, KeyReservation, LedgerFilter, LedgerPage, Pagination, StoreError, StoreTx};
