//! dapbridge bridges a Content-Length framed JSON debug protocol to a
//! native debugger engine reached through the trait-object API in
//! [`engine`]. The session core in [`session`] owns execution-state
//! tracking, handle lifetimes and breakpoint reconciliation; [`dispatch`]
//! and [`transport`] carry the wire plumbing.

pub mod dispatch;
pub mod engine;
pub mod proto;
pub mod session;
pub mod tracepoint;
pub mod transport;
