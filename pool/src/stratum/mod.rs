pub mod codec;
pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::{Connection, ConnectionState};
pub use server::{ShareEvent, StratumServer};
