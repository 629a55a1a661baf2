//! Peerpod Infrastructure Library
//!
//! Shared infrastructure used by the pod binary:
//! - Telemetry initialization
//! - Federation: peer registry, per-peer delivery, message signing and inbound
//!   authentication

pub mod federation;

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};

pub use federation::{
    DeliveryError, FederationBroker, FederationConfig, HttpTransport, InboundApplier,
    InboundOutcome, InboundProcessor, PeerRegistry, PeerTransport, SignedDelivery,
    StagedDelivery, VerifiedMessage,
};
