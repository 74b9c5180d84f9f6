//! External port management.
//!
//! Provides the configured forward [`PortRange`] and the cluster-wide
//! [`PortForwardMap`] built from every instance's port claims.

pub mod forward;
pub mod range;

pub use forward::{ForwardTarget, PortClaim, PortForwardMap};
pub use range::PortRange;
