//! NBD protocol constants used by the read-only export server.
//! Reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>.

#![allow(dead_code)]

/// A symbolic constant for 1 MiB.
#[allow(non_upper_case_globals)]
pub const MiB: u64 = 1 << 20;

// Handshake magic.
pub const NBDMAGIC: u64 = 0x4e42444d41474943;
pub const IHAVEOPT: u64 = 0x49484156454F5054;

pub const NBDMAGIC_BUF: &[u8] = b"NBDMAGIC";
pub const IHAVEOPT_BUF: &[u8] = b"IHAVEOPT";

// The export name acknowledgement opens with the transmission reply magic
// widened to 64 bits, not the option reply magic 0x3e889045565a9.
pub const EXPORT_REPLY_MAGIC: u64 = NBD_SIMPLE_REPLY_MAGIC as u64;
pub const EXPORT_REPLY_MAGIC_BUF: &[u8] = &[0, 0, 0, 0, 0x67, 0x44, 0x66, 0x98];

// Handshake option requests. Only NBD_OPT_EXPORT_NAME is served.
pub const NBD_OPT_EXPORT_NAME: u32 = 1;

// Handshake option success responses.
pub const NBD_REP_ACK: u32 = 1;

// Server handshake flags.
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client handshake flags.
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = NBD_FLAG_FIXED_NEWSTYLE as u32;
pub const NBD_FLAG_C_NO_ZEROES: u32 = NBD_FLAG_NO_ZEROES as u32;

/// The number of reserved zero bytes trailing the export information unless
/// the client negotiated NBD_FLAG_C_NO_ZEROES.
pub const EXPORT_ZEROES: usize = 124;

/// The maximum accepted length of a client option payload, which for
/// NBD_OPT_EXPORT_NAME is the export name.
pub const MAX_OPTION_LENGTH: usize = 4096;

// Transmission magic.
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;

// Transmission commands. The command field is treated as a full 32-bit value.
pub const NBD_CMD_READ: u32 = 0;
pub const NBD_CMD_WRITE: u32 = 1;
pub const NBD_CMD_DISC: u32 = 2;
pub const NBD_CMD_FLUSH: u32 = 3;
pub const NBD_CMD_TRIM: u32 = 4;

/// The largest read a client may request in one command.
pub const MAX_READ_LENGTH: usize = 32 * MiB as usize;

// Transmission negotiation flags.
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;

// Transmission error numbers.
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOTSUP: u32 = 95;
