//! An asynchronous, read-only [Network Block
//! Device (NBD)](https://en.wikipedia.org/wiki/Network_block_device) server
//! which exports the disk image files of a directory, plus a minimal client.
//!
//! Only the fixed newstyle handshake with a single `NBD_OPT_EXPORT_NAME`
//! option is supported. A rejected export is signalled by closing the
//! connection rather than with an option error reply.

extern crate bitflags;
extern crate log;
extern crate num_derive;

mod client;
mod consts;
mod export;
mod frame;
mod handshake;
mod server;
mod session;
mod traits;
mod transmit;

pub use client::{Client, ClientIoConnection};
pub use export::{Export, ExportDir, ResolveError};
pub use server::{Server, ServerConnection, ServerIoConnection, StopHandle};
pub use session::{SessionInfo, Sessions};
pub use traits::Read;
pub use transmit::Errno;

/// The default TCP port for NBD servers.
pub const DEFAULT_PORT: u16 = 10809;

/// A generic Error produced by this crate.
///
/// Unstable and subject to change.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A Result specialized for use in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A byte stream which can carry an NBD connection.
pub trait Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> Stream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}
