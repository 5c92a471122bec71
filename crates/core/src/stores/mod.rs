pub mod memory;
pub mod opensearch;

pub use memory::InMemoryBackend;
pub use opensearch::{OpenSearchBackend, OpenSearchConfig};
