pub mod saga;

pub use saga::{NewTransfer, TransferSagaService};
