pub mod models;
pub mod registry;
pub mod rpc;
pub mod sync;
pub mod tokens;
pub mod tx;

pub use registry::ClientRegistry;
pub use sync::{ChainSync, ChainSyncConfig};
