use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::io::{self, Cursor};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::consts::*;
use crate::frame::*;

/// Denotes the expected type of a `Frame` without knowledge of its associated
/// data.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FrameType {
    ServerHandshake,
    ClientFlags,
    ClientOption,
    // The client must know whether it asked the server to omit the trailing
    // reserved zeroes.
    ServerExport { zeroes: bool },
}

/// An NBD handshake data frame sent between client and server. Note that the
/// frame types here do not necessarily correspond to the NBD specification, but
/// are used to chunk up logical operations in this library.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame {
    ServerHandshake(HandshakeFlags),
    ClientFlags(ClientFlags),
    ClientOption(OptionRequest),
    ServerExport(ExportInfo),
}

bitflags! {
    /// Valid bitflags for a server handshake.
    pub(crate) struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = NBD_FLAG_FIXED_NEWSTYLE;
        const NO_ZEROES      = NBD_FLAG_NO_ZEROES;
    }

    /// Valid bitflags for a client handshake.
    pub(crate) struct ClientFlags: u32 {
        const FIXED_NEWSTYLE = NBD_FLAG_C_FIXED_NEWSTYLE;
        const NO_ZEROES      = NBD_FLAG_C_NO_ZEROES;
    }

    /// Valid bitflags for data transmission negotiation.
    pub(crate) struct TransmissionFlags: u16 {
        const HAS_FLAGS = NBD_FLAG_HAS_FLAGS;
        const READ_ONLY = NBD_FLAG_READ_ONLY;
    }
}

/// Denotes the type of known options which can be handled by the server.
#[repr(u32)]
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub(crate) enum OptionCode {
    ExportName = NBD_OPT_EXPORT_NAME,
}

/// The contents of known options which a client can send to a server.
#[derive(Debug, PartialEq)]
pub(crate) enum OptionRequest {
    // The raw export name bytes. Names are interpreted by the export resolver,
    // not by the protocol.
    ExportName(Vec<u8>),
}

impl OptionRequest {
    /// Returns the associated `OptionCode` for `self`.
    fn code(&self) -> OptionCode {
        match self {
            Self::ExportName(..) => OptionCode::ExportName,
        }
    }
}

/// Export information sent by the server when it accepts an export name.
#[derive(Debug, PartialEq)]
pub(crate) struct ExportInfo {
    pub(crate) size: u64,
    pub(crate) flags: TransmissionFlags,
    pub(crate) zeroes: bool,
}

impl Frame {
    /// Determines if enough data is available to parse a `Frame` of the given
    /// `FrameType` from `src`.
    pub(crate) fn check(src: &mut Cursor<&[u8]>, frame_type: FrameType) -> Result<()> {
        match frame_type {
            FrameType::ServerHandshake => {
                // NBDMAGIC u64 + IHAVEOPT u64 + flags u16
                skip(src, 8 + 8 + 2)
            }
            FrameType::ClientFlags => skip(src, 4),
            FrameType::ClientOption => {
                // Validate magic and length early so that a bogus header never
                // causes us to wait on a large payload.
                if get_u64(src)? != IHAVEOPT {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                // Option code, then length and payload.
                get_u32(src)?;
                let length = get_u32(src)? as usize;
                if length > MAX_OPTION_LENGTH {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                skip(src, length)
            }
            FrameType::ServerExport { zeroes } => {
                // Reply magic u64 + option u32 + reply type u32 + length u32
                // + size u64 + flags u16
                skip(src, 8 + 4 + 4 + 4 + 8 + 2)?;
                if zeroes {
                    skip(src, EXPORT_ZEROES)?;
                }

                Ok(())
            }
        }
    }

    /// Parses the next `Frame` according to the given `FrameType`.
    pub(crate) fn parse(src: &mut Cursor<&[u8]>, frame_type: FrameType) -> Result<Frame> {
        match frame_type {
            FrameType::ServerHandshake => {
                if get_u64(src)? != NBDMAGIC {
                    return Err(Error::HandshakeProtocol(frame_type));
                }
                if get_u64(src)? != IHAVEOPT {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let flags = HandshakeFlags::from_bits(get_u16(src)?)
                    .ok_or(Error::HandshakeProtocol(frame_type))?;

                Ok(Frame::ServerHandshake(flags))
            }
            FrameType::ClientFlags => {
                // Unknown client flags are ignored; only NO_ZEROES changes
                // server behavior.
                Ok(Frame::ClientFlags(ClientFlags::from_bits_truncate(
                    get_u32(src)?,
                )))
            }
            FrameType::ClientOption => {
                if get_u64(src)? != IHAVEOPT {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let code: OptionCode = FromPrimitive::from_u32(get_u32(src)?)
                    .ok_or(Error::HandshakeProtocol(frame_type))?;

                let length = get_u32(src)? as usize;
                if length > MAX_OPTION_LENGTH {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let mut data = vec![0u8; length];
                get_exact(src, &mut data)?;

                Ok(Frame::ClientOption(match code {
                    OptionCode::ExportName => OptionRequest::ExportName(data),
                }))
            }
            FrameType::ServerExport { zeroes } => {
                if get_u64(src)? != EXPORT_REPLY_MAGIC {
                    return Err(Error::HandshakeProtocol(frame_type));
                }
                if get_u32(src)? != OptionCode::ExportName as u32 {
                    return Err(Error::HandshakeProtocol(frame_type));
                }
                if get_u32(src)? != NBD_REP_ACK {
                    return Err(Error::HandshakeProtocol(frame_type));
                }
                if get_u32(src)? != 0 {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                let size = get_u64(src)?;
                let flags = TransmissionFlags::from_bits_truncate(get_u16(src)?);
                if !flags.contains(TransmissionFlags::HAS_FLAGS) {
                    return Err(Error::HandshakeProtocol(frame_type));
                }

                if zeroes {
                    skip(src, EXPORT_ZEROES)?;
                }

                Ok(Frame::ServerExport(ExportInfo {
                    size,
                    flags,
                    zeroes,
                }))
            }
        }
    }

    /// Writes the current `Frame` out to `dst`.
    pub(crate) async fn write<S: AsyncWrite + Unpin>(&self, dst: &mut S) -> io::Result<()> {
        match self {
            Frame::ServerHandshake(flags) => {
                // Opening handshake and server flags.
                dst.write_u64(NBDMAGIC).await?;
                dst.write_u64(IHAVEOPT).await?;
                dst.write_u16(flags.bits()).await?;
            }
            Frame::ClientFlags(flags) => dst.write_u32(flags.bits()).await?,
            Frame::ClientOption(option) => {
                dst.write_u64(IHAVEOPT).await?;
                dst.write_u32(option.code() as u32).await?;

                match option {
                    OptionRequest::ExportName(name) => {
                        dst.write_u32(name.len() as u32).await?;
                        dst.write_all(name).await?;
                    }
                }
            }
            Frame::ServerExport(info) => {
                // Acknowledge the export name option with an empty reply, then
                // describe the export.
                dst.write_u64(EXPORT_REPLY_MAGIC).await?;
                dst.write_u32(OptionCode::ExportName as u32).await?;
                dst.write_u32(NBD_REP_ACK).await?;
                dst.write_u32(0).await?;

                dst.write_u64(info.size).await?;
                dst.write_u16(info.flags.bits()).await?;

                if info.zeroes {
                    dst.write_all(&[0u8; EXPORT_ZEROES]).await?;
                }
            }
        }

        Ok(())
    }
}


#[cfg(test)]
mod invalid_tests {
    use super::*;

    macro_rules! frame_incomplete_tests {
        ($($name:ident: $value:expr,)*) => {
        $(
            #[test]
            fn $name() {
                let (frame_type, buf): (FrameType, Vec<u8>) = $value;
                let mut src = Cursor::new(&buf[..]);

                let err = Frame::check(&mut src, frame_type).expect_err("frame check succeeded");

                assert!(matches!(err, Error::Incomplete), "expected Error::Incomplete, but got: {:?}", err);
            }
        )*
        }
    }

    frame_incomplete_tests! {
        client_flags_short: (FrameType::ClientFlags, vec![0, 0, 0]),
        client_option_short_magic: (FrameType::ClientOption, b"IHAVEOP".to_vec()),
        client_option_short_name: (
            FrameType::ClientOption,
            [IHAVEOPT_BUF, &[0, 0, 0, 1, 0, 0, 0, 8], b"disk"].concat(),
        ),
        server_export_short_zeroes: (
            FrameType::ServerExport { zeroes: true },
            [
                EXPORT_REPLY_MAGIC_BUF,
                &[0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0],
                &[0, 0, 0, 0, 0, 0, 2, 0],
                &[0, 1],
                &[0u8; 10][..],
            ].concat(),
        ),
    }

    macro_rules! frame_protocol_error_tests {
        ($($name:ident: $value:expr,)*) => {
        $(
            #[test]
            fn $name() {
                let (frame_type, buf): (FrameType, Vec<u8>) = $value;
                let mut src = Cursor::new(&buf[..]);

                let err = Frame::check(&mut src, frame_type)
                    .and_then(|_| {
                        src.set_position(0);
                        Frame::parse(&mut src, frame_type)
                    })
                    .expect_err("frame check and parse succeeded");

                assert!(matches!(err, Error::HandshakeProtocol(_)), "expected Error::HandshakeProtocol, but got: {:?}", err);
            }
        )*
        }
    }

    frame_protocol_error_tests! {
        client_option_magic: (
            FrameType::ClientOption,
            [&b"deadbeef"[..], &[0, 0, 0, 1, 0, 0, 0, 0]].concat(),
        ),
        client_option_unsupported: (
            FrameType::ClientOption,
            // NBD_OPT_GO with an empty payload.
            [IHAVEOPT_BUF, &[0, 0, 0, 7, 0, 0, 0, 0]].concat(),
        ),
        client_option_too_long: (
            FrameType::ClientOption,
            [IHAVEOPT_BUF, &[0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]].concat(),
        ),
        server_handshake_magic: (
            FrameType::ServerHandshake,
            [IHAVEOPT_BUF, IHAVEOPT_BUF, &[0, 1 | 2]].concat(),
        ),
        server_export_error_reply: (
            FrameType::ServerExport { zeroes: false },
            [
                EXPORT_REPLY_MAGIC_BUF,
                // NBD_REP_ERR_UNKNOWN
                &[0, 0, 0, 1, 0x80, 0, 0, 6, 0, 0, 0, 0],
                &[0, 0, 0, 0, 0, 0, 2, 0],
                &[0, 1],
            ].concat(),
        ),
    }
}
