//! Event-sourced sessions for the Cadence runtime.
//!
//! A [`Session`] is an append-only event log whose `state` is always the fold
//! of every event's state delta. [`SessionStore`] is the single writer; two
//! backends are provided behind the same trait: [`InMemorySessionStore`] and
//! the durable [`FileSessionStore`].

pub mod file;
pub mod session;
pub mod store;

pub use file::FileSessionStore;
pub use session::Session;
pub use store::{GetSessionConfig, InMemorySessionStore, SessionStore};
