//! # Sluice SFTP
//!
//! Server side of the SSH File Transfer Protocol, version 3
//! (draft-ietf-secsh-filexfer-02), driven over a pair of async byte streams.
//!
//! The host process owns the transport (an SSH "sftp" subsystem channel, a
//! pipe, stdin/stdout) and hands the two halves to a [`Session`] together
//! with an [`SftpHandler`] that performs the actual storage work.
//!
//! ## Features
//!
//! - Version negotiation with server-declared extensions
//! - Frame-bounded streaming decoder with cancellation
//! - Session-owned opaque handles and paged directory listings
//! - Total mapping from handler errors to status codes
//! - [`LocalFsHandler`], a root-confined local filesystem backend
//!
//! ```no_run
//! use sluice_sftp::{LocalFsHandler, Session, SessionConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn serve() -> sluice_sftp::Result<()> {
//! let handler = LocalFsHandler::new("/srv/sftp")?;
//! let session = Session::new(
//!     tokio::io::stdin(),
//!     tokio::io::stdout(),
//!     SessionConfig::default(),
//!     handler,
//! );
//! session.run(CancellationToken::new()).await
//! # }
//! ```

pub mod attrs;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs;
pub mod handler;
pub mod handles;
pub mod protocol;
pub mod session;

pub use attrs::{Attributes, NameEntry};
pub use config::{Config, LogFormat, LoggingConfig, SessionConfig, SymlinkOrder};
pub use error::{Error, Result};
pub use fs::LocalFsHandler;
pub use handler::SftpHandler;
pub use session::Session;
