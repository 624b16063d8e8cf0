use bytes::{Buf, BytesMut};
use log::debug;
use std::io::Cursor;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;

use super::device::Device;
use super::frame::Frame;
use crate::frame::Error;
use crate::{Read, Stream};

/// The states of the data transmission phase. Requests on one connection are
/// handled strictly in arrival order: a request is fully answered before the
/// next one is parsed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// Waiting for enough bytes to parse a complete request.
    AwaitingRequest,
    /// A complete request of the given length sits at the front of the stream
    /// buffer and must be answered.
    Responding(usize),
    /// The client disconnected; no more requests will be handled.
    Closed,
}

/// A low level NBD connection type which handles data transmission operations
/// between a client stream and an exported device.
pub(crate) struct RawIoConnection<D, S> {
    device: Device<D>,
    device_buffer: Vec<u8>,
    stream: BufWriter<S>,
    stream_buffer: BytesMut,
    state: State,
}

impl<D, S> RawIoConnection<D, S>
where
    D: Read,
    S: Stream,
{
    /// Consumes the stream and buffered bytes left over from the handshake
    /// and prepares to handle I/O for `device`.
    pub(crate) fn new(device: D, stream: BufWriter<S>, stream_buffer: BytesMut) -> Self {
        Self {
            device: Device::new(device),
            // Grown on demand up to the maximum read length.
            device_buffer: Vec::new(),
            stream,
            stream_buffer,
            state: State::AwaitingRequest,
        }
    }

    /// Serves I/O requests on the connection until the client disconnects or an
    /// error occurs.
    pub(crate) async fn serve(&mut self) -> crate::Result<()> {
        loop {
            self.state = match self.state {
                State::AwaitingRequest => match self.check_request()? {
                    Some(len) => State::Responding(len),
                    None => {
                        // There is not enough buffered data to read a frame.
                        // Attempt to read more data from the socket. 0
                        // indicates "end of stream".
                        if self.stream.read_buf(&mut self.stream_buffer).await? == 0 {
                            // The remote closed the connection.
                            if self.stream_buffer.is_empty() {
                                State::Closed
                            } else {
                                return Err("connection reset by peer".into());
                            }
                        } else {
                            State::AwaitingRequest
                        }
                    }
                },
                State::Responding(len) => {
                    let state = self.respond(len).await?;

                    // Now advance the buffer beyond the current request for
                    // the next operation.
                    self.stream_buffer.advance(len);
                    state
                }
                State::Closed => return Ok(()),
            };
        }
    }

    /// Checks whether a complete request is buffered and returns its length.
    fn check_request(&self) -> crate::Result<Option<usize>> {
        let mut buf = Cursor::new(&self.stream_buffer[..]);
        match Frame::check_request(&mut buf) {
            Ok(_) => Ok(Some(buf.position() as usize)),
            // Not enough data for an entire Frame.
            Err(Error::Incomplete) => Ok(None),
            // Failed to parse.
            Err(e) => Err(e.into()),
        }
    }

    /// Parses and answers the request occupying the first `len` bytes of the
    /// stream buffer, returning the next state.
    async fn respond(&mut self, len: usize) -> crate::Result<State> {
        let mut buf = Cursor::new(&self.stream_buffer[..len]);
        let (req, handle) = Frame::parse_request(&mut buf)?;

        debug!("request {handle:#x}: {req:?}");

        // Device reads are blocking file I/O. On a multi-threaded runtime
        // other tasks are moved off this worker while the read runs.
        let device = &mut self.device;
        let device_buffer = &mut self.device_buffer;
        let res = match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => task::block_in_place(move || {
                let (device, device_buffer) = (device, device_buffer);
                device.handle_io(&req, device_buffer)
            }),
            _ => device.handle_io(&req, device_buffer),
        };

        match res {
            Some(res) => {
                // We have something to write, send it now and flush the
                // stream. The response frame borrows only the valid part of
                // the device buffer.
                res.write(&mut self.stream, handle).await?;
                self.stream.flush().await?;

                Ok(State::AwaitingRequest)
            }
            // Disconnect, no reply.
            None => Ok(State::Closed),
        }
    }
}
