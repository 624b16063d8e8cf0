use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::io::{self, Cursor};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::consts::*;
use crate::frame::*;

/// The type of a `Frame` for error reporting.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FrameType {
    Request,
    Reply,
}

/// Possible error number values for I/O replies.
#[repr(u32)]
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq)]
pub enum Errno {
    None = NBD_OK,
    Permission = NBD_EPERM,
    Io = NBD_EIO,
    NoMemory = NBD_ENOMEM,
    Invalid = NBD_EINVAL,
    NotSupported = NBD_ENOTSUP,
}

impl From<io::Error> for Errno {
    /// Converts `io::Error` into the equivalent `Errno` value.
    fn from(src: io::Error) -> Self {
        match src.kind() {
            io::ErrorKind::PermissionDenied => Errno::Permission,
            io::ErrorKind::Unsupported => Errno::NotSupported,
            io::ErrorKind::OutOfMemory => Errno::NoMemory,
            io::ErrorKind::InvalidInput => Errno::Invalid,
            _ => Errno::Io,
        }
    }
}

/// An NBD transmission data frame sent between client and server. Note that the
/// frame types here do not necessarily correspond to the NBD specification, but
/// are used to chunk up logical operations in this library.
#[derive(Debug, PartialEq)]
pub(crate) enum Frame<'a> {
    // Control operations.
    Disconnect,

    // A generic errno response message with no body.
    ErrorResponse(Errno),

    // Read operations. A successful read response carries the data which was
    // actually read, which may be shorter than requested at end of file.
    ReadRequest(Header),
    ReadResponse(Data<'a>),

    // Writes are never performed on read-only exports, but their payload must
    // still be consumed to keep the stream framed.
    WriteRequest(Header, Data<'a>),

    // Any other command, answered with an error.
    UnsupportedRequest(u32, Header),
}

/// An opaque value used by clients and server to denote matching requests and
/// responses. It is echoed verbatim and never interpreted.
pub(crate) type Handle = u64;

/// An opaque value used by clients and servers to carry data trailing a
/// header in requests and responses.
type Data<'a> = &'a [u8];

/// The header for each data transmission operation.
#[derive(Debug, PartialEq)]
pub(crate) struct Header {
    pub(crate) offset: u64,
    pub(crate) length: usize,
}

impl<'a> Frame<'a> {
    /// Determines if enough data is available to parse a request `Frame` from
    /// `src`. Write requests include their trailing payload.
    pub(crate) fn check_request(src: &mut Cursor<&[u8]>) -> Result<()> {
        if get_u32(src)? != NBD_REQUEST_MAGIC {
            return Err(Error::TransmitProtocol(FrameType::Request));
        }

        let command = get_u32(src)?;

        // Skip handle, offset.
        skip(src, 16)?;
        let length = get_u32(src)? as usize;

        if command == NBD_CMD_WRITE {
            // Refuse to buffer unbounded write payloads.
            if length > MAX_READ_LENGTH {
                return Err(Error::TransmitProtocol(FrameType::Request));
            }

            skip(src, length)?;
        }

        Ok(())
    }

    /// Parses the next request `Frame` from `src`, which must have passed
    /// `check_request`.
    pub(crate) fn parse_request(src: &mut Cursor<&'a [u8]>) -> Result<(Frame<'a>, Handle)> {
        if get_u32(src)? != NBD_REQUEST_MAGIC {
            return Err(Error::TransmitProtocol(FrameType::Request));
        }

        let command = get_u32(src)?;
        let handle = get_u64(src)?;

        let header = Header {
            offset: get_u64(src)?,
            length: get_u32(src)? as usize,
        };

        let frame = match command {
            NBD_CMD_READ => Frame::ReadRequest(header),
            NBD_CMD_DISC => Frame::Disconnect,
            NBD_CMD_WRITE => {
                // Write buffer lies beyond the end of the header, borrow it so
                // the stream can advance past it.
                let pos = src.position() as usize;
                let length = header.length;
                skip(src, length)?;

                let buf: &'a [u8] = src.get_ref();
                Frame::WriteRequest(header, &buf[pos..pos + length])
            }
            _ => Frame::UnsupportedRequest(command, header),
        };

        Ok((frame, handle))
    }

    /// Determines if enough data is available to parse a reply `Frame` from
    /// `src`. Successful replies are followed by `buf_length` bytes of data,
    /// which only the client can know from its original request.
    pub(crate) fn check_reply(src: &mut Cursor<&[u8]>, buf_length: usize) -> Result<()> {
        if get_u32(src)? != NBD_SIMPLE_REPLY_MAGIC {
            return Err(Error::TransmitProtocol(FrameType::Reply));
        }

        let errno = get_u32(src)?;
        skip(src, 8)?;

        if errno == NBD_OK {
            skip(src, buf_length)?;
        }

        Ok(())
    }

    /// Parses the next reply `Frame` from `src`, which must have passed
    /// `check_reply` with the same `buf_length`.
    pub(crate) fn parse_reply(
        src: &mut Cursor<&'a [u8]>,
        buf_length: usize,
    ) -> Result<(Frame<'a>, Handle)> {
        if get_u32(src)? != NBD_SIMPLE_REPLY_MAGIC {
            return Err(Error::TransmitProtocol(FrameType::Reply));
        }

        // Treat unknown errors as EINVALs.
        let errno = FromPrimitive::from_u32(get_u32(src)?).unwrap_or(Errno::Invalid);
        let handle = get_u64(src)?;

        let frame = match errno {
            Errno::None => {
                let pos = src.position() as usize;
                skip(src, buf_length)?;

                let buf: &'a [u8] = src.get_ref();
                Frame::ReadResponse(&buf[pos..pos + buf_length])
            }
            errno => Frame::ErrorResponse(errno),
        };

        Ok((frame, handle))
    }

    /// Writes the current `Frame` out to `dst` as a request or a response to
    /// the I/O operation denoted by `handle`.
    pub(crate) async fn write<S: AsyncWrite + Unpin>(
        &self,
        dst: &mut S,
        handle: Handle,
    ) -> io::Result<()> {
        match self {
            Self::Disconnect => {
                // Offset and length must be zero.
                Self::write_request(dst, NBD_CMD_DISC, handle, 0, 0).await?;
            }
            Self::ErrorResponse(errno) => {
                // Note that this reply may or may not actually indicate an
                // error since Errno::None indicates an operation succeeded.
                dst.write_u32(NBD_SIMPLE_REPLY_MAGIC).await?;
                dst.write_u32(*errno as u32).await?;
                dst.write_u64(handle).await?;
            }
            Self::ReadRequest(header) => {
                Self::write_request(dst, NBD_CMD_READ, handle, header.offset, header.length)
                    .await?;
            }
            Self::ReadResponse(data) => {
                dst.write_u32(NBD_SIMPLE_REPLY_MAGIC).await?;
                dst.write_u32(NBD_OK).await?;
                dst.write_u64(handle).await?;
                dst.write_all(data).await?;
            }
            Self::WriteRequest(header, body) => {
                Self::write_request(dst, NBD_CMD_WRITE, handle, header.offset, header.length)
                    .await?;
                dst.write_all(body).await?;
            }
            Self::UnsupportedRequest(command, header) => {
                Self::write_request(dst, *command, handle, header.offset, header.length).await?;
            }
        }

        Ok(())
    }

    /// Writes a request header to `dst`.
    async fn write_request<S: AsyncWrite + Unpin>(
        dst: &mut S,
        command: u32,
        handle: Handle,
        offset: u64,
        length: usize,
    ) -> io::Result<()> {
        dst.write_u32(NBD_REQUEST_MAGIC).await?;
        dst.write_u32(command).await?;
        dst.write_u64(handle).await?;
        dst.write_u64(offset).await?;
        dst.write_u32(length as u32).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST_MAGIC: &[u8] = &[0x25, 0x60, 0x95, 0x13];
    const REPLY_MAGIC: &[u8] = &[0x67, 0x44, 0x66, 0x98];
    const HANDLE: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8];

    // Magic, command, handle, offset, length.
    const REQUEST_HEADER_LENGTH: usize = 4 + 4 + 8 + 8 + 4;

    // Magic, errno, handle.
    const REPLY_HEADER_LENGTH: usize = 4 + 4 + 8;

    macro_rules! request_read_tests {
        ($($name:ident: $value:expr,)*) => {
        $(
            #[test]
            fn $name() {
                let (buf, want): (Vec<u8>, Frame) = $value;
                let mut src = Cursor::new(&buf[..]);

                Frame::check_request(&mut src).expect("failed to check frame");
                assert_eq!(src.position() as usize, buf.len(), "check did not consume the whole frame");
                src.set_position(0);

                let (got, handle) = Frame::parse_request(&mut src).expect("failed to parse frame");

                assert_eq!(want, got, "unexpected request frame");
                assert_eq!(handle, 0x0102030405060708, "unexpected handle");
            }
        )*
        }
    }

    request_read_tests! {
        read_request: (
            [REQUEST_MAGIC, &[0, 0, 0, 0], HANDLE, &[0, 0, 0, 0, 0, 0, 2, 0], &[0, 0, 1, 0]].concat(),
            Frame::ReadRequest(Header { offset: 512, length: 256 }),
        ),
        disconnect_request: (
            [REQUEST_MAGIC, &[0, 0, 0, 2], HANDLE, &[0u8; 8][..], &[0u8; 4][..]].concat(),
            Frame::Disconnect,
        ),
        write_request: (
            [REQUEST_MAGIC, &[0, 0, 0, 1], HANDLE, &[0u8; 8][..], &[0, 0, 0, 3], b"abc"].concat(),
            Frame::WriteRequest(Header { offset: 0, length: 3 }, b"abc"),
        ),
        flush_request: (
            [REQUEST_MAGIC, &[0, 0, 0, 3], HANDLE, &[0u8; 8][..], &[0u8; 4][..]].concat(),
            Frame::UnsupportedRequest(NBD_CMD_FLUSH, Header { offset: 0, length: 0 }),
        ),
        // Command flags occupy the upper bits of the command field and are not
        // stripped.
        read_request_with_flags: (
            [REQUEST_MAGIC, &[0, 1, 0, 0], HANDLE, &[0u8; 8][..], &[0, 0, 0, 1]].concat(),
            Frame::UnsupportedRequest(1 << 16, Header { offset: 0, length: 1 }),
        ),
    }

    #[test]
    fn request_incomplete() {
        for buf in [
            REQUEST_MAGIC.to_vec(),
            [REQUEST_MAGIC, &[0, 0, 0, 0], HANDLE, &[0u8; 8][..], &[0, 0]].concat(),
            // Write payload not yet received.
            [REQUEST_MAGIC, &[0, 0, 0, 1], HANDLE, &[0u8; 8][..], &[0, 0, 0, 3], b"a"].concat(),
        ] {
            let mut src = Cursor::new(&buf[..]);
            let err = Frame::check_request(&mut src).expect_err("frame check succeeded");
            assert!(matches!(err, Error::Incomplete), "expected Error::Incomplete, but got: {:?}", err);
        }
    }

    #[test]
    fn request_protocol_error() {
        for buf in [
            // Reply magic where a request is expected.
            [REPLY_MAGIC, &[0, 0, 0, 0], HANDLE, &[0u8; 8][..], &[0u8; 4][..]].concat(),
            // Oversized write payload.
            [REQUEST_MAGIC, &[0, 0, 0, 1], HANDLE, &[0u8; 8][..], &[0xff, 0xff, 0xff, 0xff]].concat(),
        ] {
            let mut src = Cursor::new(&buf[..]);
            let err = Frame::check_request(&mut src).expect_err("frame check succeeded");
            assert!(
                matches!(err, Error::TransmitProtocol(FrameType::Request)),
                "expected Error::TransmitProtocol, but got: {:?}",
                err
            );
        }
    }

    #[test]
    fn reply_parse() {
        let buf = [REPLY_MAGIC, &[0, 0, 0, 0], HANDLE, b"data"].concat();
        let mut src = Cursor::new(&buf[..]);

        Frame::check_reply(&mut src, 4).expect("failed to check reply");
        src.set_position(0);

        let (frame, handle) = Frame::parse_reply(&mut src, 4).expect("failed to parse reply");
        assert_eq!(frame, Frame::ReadResponse(b"data"));
        assert_eq!(handle, 0x0102030405060708);

        // Errors never carry a payload, regardless of the expected length.
        let buf = [REPLY_MAGIC, &[0, 0, 0, 22], HANDLE].concat();
        let mut src = Cursor::new(&buf[..]);

        Frame::check_reply(&mut src, 4).expect("failed to check error reply");
        src.set_position(0);

        let (frame, _) = Frame::parse_reply(&mut src, 4).expect("failed to parse error reply");
        assert_eq!(frame, Frame::ErrorResponse(Errno::Invalid));
    }

    #[tokio::test]
    async fn write_replies() {
        let mut got = vec![];
        Frame::ReadResponse(&[0xaa, 0xbb])
            .write(&mut got, 0x0102030405060708)
            .await
            .expect("failed to write read response");

        assert_eq!(got, [REPLY_MAGIC, &[0, 0, 0, 0], HANDLE, &[0xaa, 0xbb]].concat());
        assert_eq!(got.len(), REPLY_HEADER_LENGTH + 2);

        let mut got = vec![];
        Frame::ErrorResponse(Errno::Permission)
            .write(&mut got, 0x0102030405060708)
            .await
            .expect("failed to write error response");

        assert_eq!(got, [REPLY_MAGIC, &[0, 0, 0, 1], HANDLE].concat());
    }

    #[tokio::test]
    async fn write_requests() {
        let mut got = vec![];
        Frame::ReadRequest(Header {
            offset: 512,
            length: 256,
        })
        .write(&mut got, 0x0102030405060708)
        .await
        .expect("failed to write read request");

        assert_eq!(got.len(), REQUEST_HEADER_LENGTH);
        assert_eq!(
            got,
            [REQUEST_MAGIC, &[0, 0, 0, 0], HANDLE, &[0, 0, 0, 0, 0, 0, 2, 0], &[0, 0, 1, 0]].concat()
        );
    }

    #[test]
    fn errno_from_io_error() {
        let cases = [
            (io::ErrorKind::PermissionDenied, Errno::Permission),
            (io::ErrorKind::InvalidInput, Errno::Invalid),
            (io::ErrorKind::UnexpectedEof, Errno::Io),
            (io::ErrorKind::Other, Errno::Io),
        ];

        for (kind, want) in cases {
            assert_eq!(Errno::from(io::Error::from(kind)), want, "unexpected errno for {:?}", kind);
        }
    }
}
