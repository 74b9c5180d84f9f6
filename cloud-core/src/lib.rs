//! Foundation layer for the cloud orchestrator.
//!
//! Holds the error taxonomy every fallible operation reports through, the IPv4
//! primitives used by the network allocator, the bounded poll helper used for
//! every hypervisor wait, and the remote executor that reaches internal-only
//! cluster nodes through a jump host.

pub mod error;
pub mod net;
pub mod poll;
pub mod remote;

pub use error::{CloudError, Result};
pub use net::{Ipv4Interface, Ipv4Subnet, NetParseError};
pub use poll::{poll_until, PollPolicy};
pub use remote::{shell_quote, CommandOutput, RemoteShell, SshJumpExecutor, SshTarget};
