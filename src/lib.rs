pub mod auth;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod ids;
pub mod load;
pub mod message;
pub mod metrics;
pub mod mock;
pub mod pattern;
pub mod rest;
pub mod stats;
pub mod subscription;

pub use auth::Credentials;
pub use connection::{ConnectOptions, Connection, ConnectionState, SendPolicy};
pub use correlator::ExpectationMode;
pub use error::{Error, Result};
pub use ids::RequestIds;
pub use message::Message;
