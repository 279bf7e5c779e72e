/// Pool and token metadata records returned by the fetch pipeline
pub mod pool_metadata;

pub use pool_metadata::{PoolRecord, TokenMetadata, ZERO_ADDRESS};
