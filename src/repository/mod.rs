//! Reference repository implementations.

pub mod memory;

pub use memory::InMemoryStore;
pub use ottoflow_shared::repository::{JobRepository, PrinterRepository, RackRepository, RepositoryError};
