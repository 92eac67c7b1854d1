pub mod store;

pub use store::{EndpointRegistry, EndpointUpdate, JsonFileStore, MemoryStore, StateStore};
