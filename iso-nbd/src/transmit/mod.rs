//! Modules related to the data transmission phase of the Network Block Device
//! (NBD) protocol.

mod connection;
pub(crate) use connection::RawIoConnection;

mod device;

mod frame;
pub use frame::{Errno, FrameType};
pub(crate) use frame::{Frame, Handle, Header};
