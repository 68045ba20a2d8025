pub mod bootstrap;
pub mod chain;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod ledger;
pub mod payments;
pub mod settlement;
pub mod store;
pub mod transfers;
pub mod wallet;

#[cfg(test)]
mod testing;
