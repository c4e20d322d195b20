//! authbridge: wallet sign-in across isolated contexts.
//!
//! A page asks a relay, the relay asks the background coordinator, and the
//! background runs the SIWE flow against a wallet provider and a remote
//! auth API. Every context gates inbound traffic with a [`router::MessageRouter`]
//! (origin allow-list, token-bucket throttle, in-flight deduplication).

pub mod auth;
pub mod background;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod contexts;
pub mod error;
pub mod protocol;
pub mod remote;
pub mod router;
pub mod storage;
pub mod wallet;

pub use crate::error::{Error, ErrorKind};
