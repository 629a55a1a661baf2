//! Federation with friend pods
//!
//! - `broker`: outbound propagation and per-peer delivery
//! - `inbound`: authentication of messages received from peers
//! - `registry`: the in-memory set of friend pods
//! - `transport`: the wire, HTTP in production
//! - `signature` / `backoff`: helpers shared by the above

pub mod backoff;
pub mod broker;
pub mod inbound;
pub mod registry;
pub mod signature;
pub mod transport;

#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;

pub use broker::{FederationBroker, FederationConfig, StagedDelivery};
pub use inbound::{InboundApplier, InboundOutcome, InboundProcessor, VerifiedMessage};
pub use registry::PeerRegistry;
pub use transport::{DeliveryError, HttpTransport, PeerTransport, SignedDelivery};
