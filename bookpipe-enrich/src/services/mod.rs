//! Service modules for description enrichment

pub mod checkpoint_store;
pub mod description;
pub mod fetch_client;
pub mod throttle;

pub use checkpoint_store::{CheckpointError, CheckpointSink, CheckpointSnapshot, CheckpointStore};
pub use description::{description_from_payload, normalize_description};
pub use fetch_client::{
    DescriptionApi, FetchClient, FetchError, OpenLibraryApi, OPEN_LIBRARY_BASE_URL,
};
pub use throttle::Throttle;
