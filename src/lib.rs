//! kube-event-relay watches a resource collection on the apiserver
//! and relays every change to websocket subscribers in near-real time.
//!
//! The pipeline runs leaves first:
//! a [`WatchSource`](source::WatchSource) feeds raw change records to the
//! [`Supervisor`](supervisor::Supervisor), which restarts the feed with backoff
//! when it fails, normalizes each record into an [`Event`]
//! and ingests it into the [`Hub`](hub::Hub).
//! The hub fans every event out to one bounded queue per subscriber,
//! and each [`Session`](session::Session) drains its queue into its own websocket.
//! A slow or dead subscriber only ever loses its own events.

pub mod config;
pub use config::Config;
pub mod event;
pub use event::{ChangeKind, Event};
pub mod hub;
pub mod normalize;
mod runner;
pub use runner::{run, serve, RunError};
pub mod server;
pub mod session;
pub mod source;
pub mod supervisor;

#[cfg(test)]
mod tests;
