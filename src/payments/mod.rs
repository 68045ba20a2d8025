pub mod models;
pub mod router;

pub use router::{PaymentRouter, RouterConfig};
