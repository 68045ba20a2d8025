pub mod blockchain;
pub mod channel;
pub mod internal;
pub mod router;

pub use blockchain::{BlockchainExecutor, GasSettings};
pub use channel::ChannelExecutor;
pub use internal::InternalExecutor;
pub use router::{ExecutorRouter, RailExecutor, RailReceipt};
