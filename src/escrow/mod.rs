pub mod gateway;
pub mod ledger;

pub use gateway::{HttpPaymentGateway, PaymentGateway, SandboxGateway};
pub use ledger::{idempotency_key, EscrowLedger, Movement};
