pub mod locks;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use locks::EntityLocks;
pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use store::PersistenceStore;
