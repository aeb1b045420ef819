//! Domain models for credit-grant-service.

mod application;
mod grant;
mod subscription;
mod wallet;

pub use application::{
    ApplicationReason, ApplicationStatus, CreditGrantApplication,
    ListCreditGrantApplicationsFilter, ProcessingSummary,
};
pub use grant::{
    CreateCreditGrant, CreditGrant, CreditGrantCadence, CreditGrantPeriod, CreditGrantScope,
    ExpirationDurationUnit, ExpirationType, ListCreditGrantsFilter, RecordStatus,
    UpdateCreditGrant,
};
pub use subscription::{PlanSnapshot, SubscriptionSnapshot, SubscriptionStatus};
pub use wallet::{CreditWalletRequest, Wallet, WalletTransaction, SUBSCRIPTION_CREDIT_GRANT_REASON};
