pub mod cache;
pub mod db;
pub mod error;
pub mod facade;
pub mod log;
pub mod vector;

pub use cache::HotCache;
pub use error::{Result, StoreError};
pub use facade::{MemoryStore, MirrorQueue};
pub use log::{LogHandle, LogStore};
pub use vector::{VectorHit, VectorIndex};
