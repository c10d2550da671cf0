//! Connection pooling and connectivity observation.

pub mod connection;
pub mod observer;

pub use connection::{ConnState, Connection, ConnectionPool};
pub use observer::{ConnectionEvent, ConnectionObserver, ObserverBus};
