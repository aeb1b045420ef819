//! Services module for credit-grant-service.

pub mod clock;
pub mod credit_grants;
pub mod database;
pub mod expiry;
pub mod in_memory;
pub mod lifecycle;
pub mod metrics;
pub mod period;
pub mod ports;
pub mod processor;
pub mod reconciler;
pub mod scheduler;

pub use clock::{Clock, ManualClock, SystemClock};
pub use credit_grants::CreditGrantService;
pub use database::Database;
pub use metrics::{
    get_metrics, init_metrics, record_application_outcome, record_credits_granted, record_error,
    record_grant_operation, record_sweep,
};
pub use ports::{
    Collaborators, CreditGrantApplicationStore, CreditGrantStore, PlanSource, SubscriptionSource,
    WalletLedger,
};
pub use processor::Processor;
