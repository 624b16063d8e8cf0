//! Modules related to the fixed newstyle handshake phase of the Network Block
//! Device (NBD) protocol.

mod connection;
pub(crate) use connection::RawConnection;

pub(crate) mod frame;
pub use frame::FrameType;
