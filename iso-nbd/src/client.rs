use bytes::{Buf, BytesMut};
use std::io::{self, Cursor};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::consts::{NBD_CMD_DISC, NBD_CMD_READ, NBD_CMD_WRITE};
use crate::frame::Error;
use crate::handshake::frame::{Frame as HandshakeFrame, *};
use crate::handshake::RawConnection;
use crate::transmit::{Errno, Frame as TransmitFrame, Handle, Header};
use crate::Stream;

/// An NBD client connection which has completed the opening of the fixed
/// newstyle handshake and can select an export.
pub struct Client<S> {
    conn: RawConnection<S>,
}

impl Client<TcpStream> {
    /// Establishes a TCP connection with the NBD server at `addr` and
    /// immediately performs the client handshake operation.
    pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Self> {
        // Set TCP_NODELAY, per:
        // https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md#protocol-phases.
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Client::handshake(stream).await
    }
}

impl<S: Stream> Client<S> {
    /// Initiates the NBD client handshake with a server using `stream`
    /// (typically a TCP connection, but this is not required).
    pub async fn handshake(stream: S) -> crate::Result<Self> {
        let mut conn = RawConnection::new(stream);

        // Expect the server to support the fixed newstyle handshake with no
        // zeroes flag enabled.
        let server_flags = match conn
            .read_frame(FrameType::ServerHandshake)
            .await?
            .ok_or("server terminated connection while reading server handshake")?
        {
            HandshakeFrame::ServerHandshake(flags) => flags,
            _ => return Err("server sent invalid server handshake".into()),
        };

        if !server_flags.contains(HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES) {
            return Err("cannot negotiate fixed newstyle handshake with server".into());
        }

        conn.write_frame(HandshakeFrame::ClientFlags(
            ClientFlags::FIXED_NEWSTYLE | ClientFlags::NO_ZEROES,
        ))
        .await?;

        Ok(Self { conn })
    }

    /// Requests the export `name` and enters data transmission. If the server
    /// closes the connection instead of accepting the export, `None` is
    /// returned.
    pub async fn export(mut self, name: &str) -> crate::Result<Option<ClientIoConnection<S>>> {
        self.conn
            .write_frame(HandshakeFrame::ClientOption(OptionRequest::ExportName(
                name.as_bytes().to_vec(),
            )))
            .await?;

        let info = match self
            .conn
            .read_frame(FrameType::ServerExport { zeroes: false })
            .await
        {
            Ok(Some(HandshakeFrame::ServerExport(info))) => info,
            Ok(Some(_)) => return Err("server sent invalid export reply".into()),
            // The server rejects exports by hanging up.
            Ok(None) => return Ok(None),
            Err(err) => match err.downcast_ref::<io::Error>() {
                Some(err) if err.kind() == io::ErrorKind::ConnectionReset => return Ok(None),
                _ => return Err(err),
            },
        };

        Ok(Some(ClientIoConnection::new(
            self.conn.stream,
            self.conn.buffer,
            info.size,
            info.flags,
        )))
    }
}

/// An NBD client connection which is ready to perform data transmission.
/// This type is constructed by using the [`Client`]'s `export` method.
pub struct ClientIoConnection<S> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    size: u64,
    flags: TransmissionFlags,
    handle: Handle,
}

impl<S: Stream> ClientIoConnection<S> {
    /// Creates a connection ready for I/O by consuming the stream and buffer
    /// from the handshake phase.
    pub(crate) fn new(
        stream: BufWriter<S>,
        buffer: BytesMut,
        size: u64,
        flags: TransmissionFlags,
    ) -> Self {
        Self {
            stream,
            buffer,
            size,
            flags,
            handle: 0,
        }
    }

    /// Returns the size of the export in bytes as reported by the server.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reports whether the server marked the export read-only.
    pub fn readonly(&self) -> bool {
        self.flags.contains(TransmissionFlags::READ_ONLY)
    }

    /// Reads `length` bytes at `offset` from the export. Reads which extend
    /// past the end of the export return only the bytes which exist.
    pub async fn read(&mut self, offset: u64, length: u32) -> crate::Result<Vec<u8>> {
        let handle = self
            .write_frame(TransmitFrame::ReadRequest(Header {
                offset,
                length: length as usize,
            }))
            .await?;

        // The server sends whatever lies between offset and the end of the
        // export.
        let expected = self.size.saturating_sub(offset).min(length as u64) as usize;

        match self.read_reply(handle, expected).await? {
            Ok(data) => Ok(data),
            Err(errno) => Err(format!("server failed read: {errno:?}").into()),
        }
    }

    /// Sends a raw command which carries no reply payload, such as a flush or
    /// trim, and returns the server's error number. Write commands are sent
    /// with `length` zero bytes of payload.
    pub async fn command(&mut self, command: u32, offset: u64, length: u32) -> crate::Result<Errno> {
        let header = Header {
            offset,
            length: length as usize,
        };

        let body;
        let frame = match command {
            NBD_CMD_READ | NBD_CMD_DISC => {
                return Err("use read or disconnect for this command".into())
            }
            NBD_CMD_WRITE => {
                body = vec![0u8; length as usize];
                TransmitFrame::WriteRequest(header, &body)
            }
            command => TransmitFrame::UnsupportedRequest(command, header),
        };

        let handle = self.write_frame(frame).await?;
        match self.read_reply(handle, 0).await? {
            Ok(_) => Ok(Errno::None),
            Err(errno) => Ok(errno),
        }
    }

    /// Initiates a client disconnect from the server and terminates the
    /// connection.
    pub async fn disconnect(mut self) -> crate::Result<()> {
        self.write_frame(TransmitFrame::Disconnect).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Writes a single `TransmitFrame` value to the server and returns the
    /// handle it was sent with.
    async fn write_frame(&mut self, frame: TransmitFrame<'_>) -> io::Result<Handle> {
        // For every write, increment the handle counter.
        self.handle += 1;

        frame.write(&mut self.stream, self.handle).await?;
        self.stream.flush().await?;

        Ok(self.handle)
    }

    /// Reads the reply for `handle`, which carries `buf_length` bytes of data
    /// on success.
    async fn read_reply(
        &mut self,
        handle: Handle,
        buf_length: usize,
    ) -> crate::Result<std::result::Result<Vec<u8>, Errno>> {
        loop {
            let mut buf = Cursor::new(&self.buffer[..]);
            match TransmitFrame::check_reply(&mut buf, buf_length) {
                Ok(_) => {
                    let len = buf.position() as usize;
                    buf.set_position(0);

                    let (frame, got) = TransmitFrame::parse_reply(&mut buf, buf_length)?;
                    if got != handle {
                        return Err(format!(
                            "server replied to handle {got:#x}, expected {handle:#x}"
                        )
                        .into());
                    }

                    let reply = match frame {
                        TransmitFrame::ReadResponse(data) => Ok(data.to_vec()),
                        TransmitFrame::ErrorResponse(errno) => Err(errno),
                        _ => return Err("server sent invalid reply".into()),
                    };

                    self.buffer.advance(len);
                    return Ok(reply);
                }
                // Not enough data for an entire Frame.
                Err(Error::Incomplete) => {}
                // Failed to parse.
                Err(e) => return Err(e.into()),
            }

            if self.stream.read_buf(&mut self.buffer).await? == 0 {
                return Err("server closed connection while sending reply".into());
            }
        }
    }
}
