//! Inter-process communication: a named-event channel over a process
//! boundary, and a correlation-based RPC protocol on top of it.

pub mod rpc;
pub mod transport;
