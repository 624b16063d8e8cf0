use std::io::{self, SeekFrom};

use super::frame::{Errno, Frame};
use crate::consts::MAX_READ_LENGTH;
use crate::Read;

/// A read-only export device owned by a single session.
pub(crate) struct Device<D> {
    device: D,
}

impl<D: Read> Device<D> {
    /// Wraps `device` for I/O request handling.
    pub(crate) fn new(device: D) -> Self {
        Self { device }
    }

    /// Handles a single I/O operation `req` using the reusable device buffer
    /// `buf`. A reply is always produced except for disconnects.
    pub(crate) fn handle_io<'a>(&mut self, req: &Frame<'_>, buf: &'a mut Vec<u8>) -> Option<Frame<'a>> {
        match req {
            // No reply.
            Frame::Disconnect => None,
            Frame::ReadRequest(req) => {
                if req.length > MAX_READ_LENGTH {
                    return Some(Frame::ErrorResponse(Errno::Invalid));
                }

                if buf.len() < req.length {
                    buf.resize(req.length, 0);
                }

                let res = match self.read_at(&mut buf[..req.length], req.offset) {
                    Ok(length) => Frame::ReadResponse(&buf[..length]),
                    Err(err) => Frame::ErrorResponse(err.into()),
                };

                Some(res)
            }
            // The payload was already consumed from the stream.
            Frame::WriteRequest(..) => Some(Frame::ErrorResponse(Errno::Permission)),
            Frame::UnsupportedRequest(..) => Some(Frame::ErrorResponse(Errno::Invalid)),
            // Frames a client would handle.
            Frame::ErrorResponse(..) | Frame::ReadResponse(..) => {
                Some(Frame::ErrorResponse(Errno::Invalid))
            }
        }
    }

    /// Fills as much of `buf` as possible starting at `offset`. Reaching end of
    /// file early is not an error; the number of bytes read is returned.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let position = offset.checked_add(total as u64).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "read offset overflows")
            })?;

            match self.read_once(&mut buf[total..], position) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }

    fn read_once(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        // Make use of fused operation where possible, or fall back to manual
        // seek+read on the session's own handle.
        if let Some(res) = self.device.read_at(buf, offset) {
            res
        } else {
            self.device.seek(SeekFrom::Start(offset))?;
            self.device.read(buf)
        }
    }
}
