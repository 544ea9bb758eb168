pub mod memory;
pub mod registry;
pub mod static_registry;
pub mod store;

pub use memory::MemoryStore;
pub use registry::*;
pub use static_registry::StaticRegistry;
pub use store::*;
