//! Listen socket surface: one TCP endpoint, or a Unix-domain socket when
//! the configured host begins with `/`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use herald_common::config::ListenConfig;

#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(config: &ListenConfig) -> io::Result<Listener> {
        if config.host.starts_with('/') {
            remove_stale_socket(&config.host)?;
            Ok(Listener::Unix(UnixListener::bind(&config.host)?))
        } else {
            Ok(Listener::Tcp(TcpListener::bind(config.address()).await?))
        }
    }

    pub async fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Connection::Tcp(stream), addr.to_string()))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), "[local]".to_string()))
            }
        }
    }
}

/// We can't guarantee the socket file gets cleaned up in every case (a
/// crash, say), so a pre-existing file has to be dealt with. Only remove
/// it if it actually is a socket; we wouldn't want to remove regular
/// files or directories.
fn remove_stale_socket(path: &str) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("file \"{}\" already exists and is not a UNIX socket", path),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Enable TCP keep-alive if the configuration asks for it. Unix-domain
/// connections have no keep-alive to speak of.
pub fn maybe_enable_keepalive(config: &ListenConfig, conn: &Connection) {
    if !config.keepalive {
        return;
    }
    if let Connection::Tcp(stream) = conn {
        let sock = socket2::SockRef::from(stream);
        if let Err(e) = sock.set_keepalive(true) {
            tracing::warn!("failed to enable TCP keepalive: {}", e);
        }
    }
}

/// An accepted client connection.
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
