pub mod client;
pub mod models;
pub mod sync;

pub use client::{ChannelClient, RestChannelClient};
pub use sync::ChannelSync;
