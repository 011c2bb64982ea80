use std::io;

use crate::common::debug;

/// A `TcpStream`, `UnixStream`, or TLS session, which implement
/// `AsyncRead` and `AsyncWrite` transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    UnixSocket(tokio::net::UnixStream),
    #[cfg(feature = "ssl")]
    Tls(Box<tokio_openssl::SslStream<tokio::net::TcpStream>>),
    #[cfg(test)]
    Duplex(tokio::io::DuplexStream),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16, keep_alive: bool) -> io::Result<Socket> {
        let mut last_err = None;

        for addr in tokio::net::lookup_host((host, port)).await? {
            let socket = match addr {
                std::net::SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
                std::net::SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
            };
            socket.set_keepalive(keep_alive)?;

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!("Connected via TCP Stream: {:?}", stream.local_addr());
                    return Ok(Socket { kind: Kind::Tcp(stream) });
                }
                Err(err) => last_err = Some(err),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no address")
        }))
    }

    pub async fn connect_socket(path: &str) -> io::Result<Socket> {
        #[cfg(unix)]
        {
            let socket = tokio::net::UnixStream::connect(path).await?;
            debug!("Connected via Unix socket: {:?}", socket.peer_addr()?.as_pathname());
            Ok(Socket { kind: Kind::UnixSocket(socket) })
        }

        #[cfg(not(unix))]
        {
            let _ = path;
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            ))
        }
    }

    /// Whether the connection is TLS protected.
    pub fn is_encrypted(&self) -> bool {
        #[cfg(feature = "ssl")]
        {
            matches!(self.kind, Kind::Tls(_))
        }
        #[cfg(not(feature = "ssl"))]
        {
            false
        }
    }

    /// Returns `true` when the SSLRequest preamble can be attempted.
    pub fn supports_tls(&self) -> bool {
        matches!(self.kind, Kind::Tcp(_))
    }

    /// Perform the TLS handshake over an established TCP stream.
    ///
    /// The server must already have answered `S` to the SSLRequest preamble.
    #[cfg(feature = "ssl")]
    pub async fn upgrade_tls(
        self,
        domain: &str,
        connector: &openssl::ssl::SslConnector,
    ) -> io::Result<Socket> {
        let Kind::Tcp(stream) = self.kind else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS upgrade requires a TCP stream",
            ));
        };

        let ssl = connector
            .configure()
            .and_then(|conf| conf.into_ssl(domain))
            .map_err(io::Error::other)?;

        let mut stream = tokio_openssl::SslStream::new(ssl, stream).map_err(io::Error::other)?;

        std::pin::Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()))?;

        debug!("TLS session established for {domain:?}");
        Ok(Socket { kind: Kind::Tls(Box::new(stream)) })
    }

    #[cfg(test)]
    pub fn duplex(stream: tokio::io::DuplexStream) -> Socket {
        Socket { kind: Kind::Duplex(stream) }
    }

    pub fn shutdown(&mut self) -> impl Future<Output = io::Result<()>> {
        tokio::io::AsyncWriteExt::shutdown(self)
    }
}

macro_rules! for_each_kind {
    ($self:ident, $stream:pat => $body:expr) => {
        match &mut $self.kind {
            Kind::Tcp($stream) => $body,
            #[cfg(unix)]
            Kind::UnixSocket($stream) => $body,
            #[cfg(feature = "ssl")]
            Kind::Tls($stream) => $body,
            #[cfg(test)]
            Kind::Duplex($stream) => $body,
        }
    };
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        use std::pin::Pin;
        for_each_kind!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        for_each_kind!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_write_vectored(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        for_each_kind!(self, s => Pin::new(s).poll_write_vectored(cx, bufs))
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        true
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        use std::pin::Pin;
        for_each_kind!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), std::io::Error>> {
        use std::pin::Pin;
        for_each_kind!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(tcp) => std::fmt::Debug::fmt(tcp, f),
            #[cfg(unix)]
            Kind::UnixSocket(unix) => std::fmt::Debug::fmt(unix, f),
            #[cfg(feature = "ssl")]
            Kind::Tls(_) => f.write_str("SslStream"),
            #[cfg(test)]
            Kind::Duplex(_) => f.write_str("DuplexStream"),
        }
    }
}
