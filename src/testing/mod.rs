//! Testing utilities and mock implementations
//!
//! Mock transports backed by an in-memory broker, so lifecycle behaviour can
//! be exercised without a running Kafka cluster.

pub mod mocks;

pub use mocks::*;
