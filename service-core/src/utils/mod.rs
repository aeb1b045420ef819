pub mod idempotency;

pub use idempotency::generate_key;
