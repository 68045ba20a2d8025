pub mod directory;
pub mod keys;

pub use directory::{InMemoryUserDirectory, UserDirectory};
pub use keys::{AccountProvisioner, GatewayAccount, KeyPairProvisioner};
