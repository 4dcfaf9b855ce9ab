//! A SOCKS version 6 proxy library
//!
//! ## SOCKS6 Implementation
//!
//! - Features:
//!     - NOOP, CONNECT, BIND (single accept and backlog), UDP ASSOCIATE
//!     - No Authentication, Username/Password Authentication and a
//!       two-stage test method
//!     - Sessions and idempotence tokens
//!     - Stack options (TTL, TOS, backlog, port parity, ICMP error relay)
//!     - UDP over the datagram channel or over the control stream
//!     - Async using tokio, cancellation via `CancellationToken`
//!     - Time-out based cleanup of sessions, listeners and associations
//! - [SOCKS Protocol Version 6 (draft-olteanu-intarea-socks-6-11)](https://datatracker.ietf.org/doc/html/draft-olteanu-intarea-socks-6-11)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socks6::{Socks6Server, auth::UserPass};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Socks6Server::new("127.0.0.1:1080")
//!         .with_auth(Some(UserPass::new("user", "pass")));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod backlog;
pub mod client;
pub mod commands;
pub mod error;
pub mod messages;
pub mod option_set;
pub mod options;
pub mod outbound;
pub mod protocol;
pub mod server;
pub mod session;
pub mod stack_options;
pub mod udp_assoc;
pub mod udp_message;
pub mod util;

// Re-export main types at crate root for convenience
pub use address::{Addr, Host};
pub use auth::UserPass;
pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use messages::{AuthenticationReply, OperationReply, Request};
pub use option_set::OptionSet;
pub use protocol::{AuthMethod, Command, ReplyCode};
pub use server::{Filtering, ServerConfig, Socks6Server};
pub use udp_message::UdpMessage;
