#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]

//! gwlink library: transport core of the gateway command-line client.
//!
//! - `descriptor`: connection descriptors, TLS roots, WebSocket connect
//! - `wire`: BSON frame decoding into envelopes
//! - `matcher`: streaming output matchers (raw, lines, Unity, exit-code)
//! - `download`: side-channel HTTP downloads referenced by envelopes
//! - `session`: job output session (heartbeat, timeouts, close handling)
//! - `tunnel`: local TCP to WebSocket tunnel server for GDB
//! - `input`: local keyboard relay for interactive sessions
//! - `config`: configuration loading
//! - `error`: error taxonomy and user-facing diagnostics

pub mod config;
pub mod descriptor;
pub mod download;
pub mod error;
pub mod input;
pub mod matcher;
pub mod session;
pub mod tunnel;
pub mod util;
pub mod wire;

pub use config::Config;
pub use descriptor::{ConnectionDescriptor, SessionKind};
pub use error::{ConnectError, DownloadError, SessionError, TunnelError};
pub use matcher::{MatcherKind, OutputMatcher};
pub use session::{JobOutputSession, SessionOptions, SessionResult};
pub use tunnel::{TunnelHandle, TunnelServer};
