//! Common utilities and types

pub mod conn;
pub mod error;
pub mod metadata;
pub mod ring;

pub use conn::{Chain, Chained, Closer, ProxyPacketConn, ProxyStream, DIRECT};
pub use error::{Error, Result};
pub use metadata::{ConnType, DnsMode, Metadata, Network};
pub use ring::{Ring, RingRead};
