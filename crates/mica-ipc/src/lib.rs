//! Shared-memory plumbing for the mica GPU channel.
//!
//! This crate is deliberately policy-free: it knows how bytes and offsets
//! move between two processes, not what the messages mean. It provides:
//!
//! - [`SharedMemory`] / [`HandleBroker`]: region allocation and the opaque
//!   handle table regions travel through.
//! - [`MsgRing`]: the MPSC variable-record ring a transport direction runs on.
//! - [`cmdring`]: the per-endpoint command ring with single-writer put/get
//!   offsets.
//! - [`Transport`]: one region packaged as a request ring + reply ring with
//!   peer liveness.

pub mod cmdring;
pub mod layout;
pub mod poll;
pub mod ring;
pub mod shmem;
pub mod transport;

pub use cmdring::{CmdRingConsumer, CmdRingError, CmdRingFault, CmdRingProducer, CmdWriteError};
pub use poll::Backoff;
pub use ring::{MsgRing, PopError, PushError};
pub use shmem::{HandleBroker, SharedMemory, ShmemError, ShmemHandle};
pub use transport::{Transport, TransportClient, TransportConfig, TransportError, TransportServer};
