pub mod engine;
pub mod models;

pub use engine::TransferEngine;
