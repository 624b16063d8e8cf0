use bytes::BytesMut;
use log::{debug, info, warn};
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufWriter;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Notify;
use tokio::time;

use crate::export::{Export, ExportDir};
use crate::handshake::frame::*;
use crate::handshake::RawConnection;
use crate::session::{SessionInfo, Sessions};
use crate::transmit::RawIoConnection;
use crate::{Read, Stream};

/// An NBD server which accepts incoming TCP connections and serves the files
/// of an [`ExportDir`] as read-only exports.
pub struct Server {
    listener: TcpListener,
    exports: Arc<ExportDir>,
    sessions: Sessions,
    stop: StopHandle,
}

/// A handle which stops a running [`Server`] from accepting connections.
#[derive(Clone, Debug, Default)]
pub struct StopHandle {
    notify: Arc<Notify>,
}

impl StopHandle {
    /// Stops the associated [`Server`] and closes its listening socket.
    /// Sessions which are already established keep running until their
    /// clients disconnect.
    pub fn stop(&self) {
        // A stored permit makes this effective even before the server runs.
        self.notify.notify_one();
    }
}

impl Server {
    /// Binds a TCP listener for the NBD server at `addr` which is prepared to
    /// accept incoming connections for `exports`.
    pub async fn bind<T: ToSocketAddrs>(addr: T, exports: ExportDir) -> crate::Result<Self> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Server {
            listener,
            exports: Arc::new(exports),
            sessions: Sessions::default(),
            stop: StopHandle::default(),
        })
    }

    /// Returns the local address that the `Server`'s TCP listener is bound to.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Returns the registry of sessions currently in data transmission.
    pub fn sessions(&self) -> Sessions {
        self.sessions.clone()
    }

    /// Returns a handle which can stop the server once it is running.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Continuously accepts and serves incoming NBD connections until stopped.
    pub async fn run(self) -> crate::Result<()> {
        let addr = self.local_addr()?;
        info!(
            "{}: serving exports from {}",
            addr,
            self.exports.root().display()
        );

        let mut backoff = Backoff::new();
        loop {
            let accepted = tokio::select! {
                _ = self.stop.notify.notified() => {
                    info!("{}: listener stopped", addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted,
            };

            let (socket, peer) = match accepted {
                Ok(conn) => {
                    backoff.reset();
                    conn
                }
                Err(err) => {
                    // Accept failures such as descriptor exhaustion may
                    // persist; keep listening, but pause between attempts.
                    let delay = backoff.next_delay();
                    warn!(
                        "{}: failed to accept connection, retrying in {:?}: {}",
                        addr, delay, err
                    );

                    tokio::select! {
                        _ = self.stop.notify.notified() => {
                            info!("{}: listener stopped", addr);
                            return Ok(());
                        }
                        _ = time::sleep(delay) => continue,
                    }
                }
            };

            // Set TCP_NODELAY, per:
            // https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md#protocol-phases.
            if let Err(err) = socket.set_nodelay(true) {
                warn!("{}: failed to set TCP_NODELAY: {}", peer, err);
            }

            let exports = self.exports.clone();
            let sessions = self.sessions.clone();
            tokio::spawn(async move {
                info!("{}: client connected", peer);

                match Self::process(&exports, &sessions, socket, peer).await {
                    Ok(()) => info!("{}: client disconnected", peer),
                    Err(err) => warn!("{}: connection closed: {}", peer, err),
                }
            });
        }
    }

    /// Processes a single incoming NBD client connection.
    async fn process(
        exports: &ExportDir,
        sessions: &Sessions,
        socket: TcpStream,
        peer: SocketAddr,
    ) -> crate::Result<()> {
        let conn = ServerConnection::new(socket).handshake(exports).await?;

        let export = conn.export();
        info!(
            "{}: serving export {:?} ({} bytes)",
            peer, export.name, export.size
        );

        // Listed until transmission ends for any reason.
        let _session = sessions.register(SessionInfo {
            peer,
            export: export.name.clone(),
            size: export.size,
        });

        conn.transmit().await
    }
}

/// The delay between retries of a failing accept, doubling from 10ms up to
/// one second and starting over after a successful accept.
#[derive(Debug)]
struct Backoff {
    delay: Duration,
}

impl Backoff {
    const MIN: Duration = Duration::from_millis(10);
    const MAX: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { delay: Self::MIN }
    }

    /// Returns the delay before the next attempt.
    fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::MAX);
        delay
    }

    fn reset(&mut self) {
        self.delay = Self::MIN;
    }
}

/// An NBD server connection which negotiates an export with a client.
pub struct ServerConnection<S> {
    conn: RawConnection<S>,
}

impl<S: Stream> ServerConnection<S> {
    /// Creates an NBD server connection wrapping `stream` (typically an
    /// accepted client TCP connection) and allocates memory to begin serving
    /// the client's requests.
    pub fn new(stream: S) -> Self {
        Self {
            conn: RawConnection::new(stream),
        }
    }

    /// Performs the fixed newstyle server handshake with a client, resolving
    /// the export name it requests against `exports`.
    ///
    /// Exactly one option is accepted and it must be an export name. On any
    /// failure, including an unknown or forbidden export, an error is returned
    /// without replying so the caller closes the connection before data
    /// transmission begins.
    pub async fn handshake(
        mut self,
        exports: &ExportDir,
    ) -> crate::Result<ServerIoConnection<S, File>> {
        // Send opening handshake, then read the client's flags.
        self.conn
            .write_frame(Frame::ServerHandshake(
                HandshakeFlags::FIXED_NEWSTYLE | HandshakeFlags::NO_ZEROES,
            ))
            .await?;

        let client_flags = match self
            .conn
            .read_frame(FrameType::ClientFlags)
            .await?
            .ok_or("client terminated while sending client flags")?
        {
            Frame::ClientFlags(flags) => flags,
            _ => return Err("client sent invalid client flags frame".into()),
        };

        debug!("client flags: {:?}", client_flags);

        let name = match self
            .conn
            .read_frame(FrameType::ClientOption)
            .await?
            .ok_or("client terminated while sending options")?
        {
            Frame::ClientOption(OptionRequest::ExportName(name)) => name,
            _ => return Err("client sent invalid client option frame".into()),
        };

        // Resolve and open before acknowledging so that a missing or
        // unreadable export never produces a reply.
        let (export, device) = exports.resolve(&name)?;

        self.conn
            .write_frame(Frame::ServerExport(ExportInfo {
                size: export.size,
                flags: TransmissionFlags::HAS_FLAGS | TransmissionFlags::READ_ONLY,
                zeroes: !client_flags.contains(ClientFlags::NO_ZEROES),
            }))
            .await?;

        Ok(ServerIoConnection::new(
            self.conn.stream,
            self.conn.buffer,
            device,
            export,
        ))
    }
}

/// An NBD server connection which is ready to perform data transmission: the
/// client's stream, its own handle to the backing file and the export
/// metadata. This type is constructed by using the [`ServerConnection`]'s
/// `handshake` method.
pub struct ServerIoConnection<S, D> {
    stream: BufWriter<S>,
    buffer: BytesMut,
    device: D,
    export: Export,
}

impl<S: Stream, D: Read> ServerIoConnection<S, D> {
    /// Creates a connection ready for I/O by consuming the stream and buffer
    /// from the handshake phase.
    pub(crate) fn new(stream: BufWriter<S>, buffer: BytesMut, device: D, export: Export) -> Self {
        Self {
            stream,
            buffer,
            device,
            export,
        }
    }

    /// Returns the export negotiated by the client.
    pub fn export(&self) -> &Export {
        &self.export
    }

    /// Begins data transmission with the client. This method blocks until the
    /// client disconnects or an unrecoverable error occurs; the device and
    /// stream are closed when it returns.
    pub async fn transmit(self) -> crate::Result<()> {
        RawIoConnection::new(self.device, self.stream, self.buffer)
            .serve()
            .await
    }
}
