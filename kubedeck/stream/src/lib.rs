//! The stream proxy engine: one task per session, joining a client socket to
//! a cluster-side stream with bounded buffering.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod metrics;
mod registry;
mod session;

#[cfg(test)]
mod tests;

pub use self::{
    metrics::SessionMetrics,
    registry::{SessionHandle, SessionRegistry},
    session::{Session, SessionConfig},
};
