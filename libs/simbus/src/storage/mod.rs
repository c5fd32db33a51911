//! Result storage: per-element channel buffers with rate gating, fanned
//! out to pluggable backends (CSV built in).

mod backend;
mod channel_storage;
mod component_storage;
mod csv;
mod results;

pub use backend::Backend;
pub use channel_storage::ChannelStorage;
pub use component_storage::{ChannelClass, ComponentStorage, StorageGates, StoreLevel};
pub use csv::CsvBackend;
pub use results::{BackendHub, ResultsStorage};
