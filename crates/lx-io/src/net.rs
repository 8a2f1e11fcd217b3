//! Network endpoints for the daemon's two surfaces: the local IPC socket
//! (Unix-domain) and loopback TCP used by tests and the healthz probe.

use camino::Utf8Path;
use eyre::Result;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A network endpoint - either TCP or Unix socket
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// TCP endpoint (host:port)
    Tcp(String),
    /// Unix socket path
    #[cfg(unix)]
    Unix(camino::Utf8PathBuf),
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// Accepts:
    /// - `host:port` or `tcp://host:port` → TCP
    /// - `unix:/path/to/socket` → Unix socket
    /// - Absolute path starting with `/` → Unix socket (convenience)
    pub fn parse(endpoint: &str) -> Result<Self> {
        let endpoint = endpoint.trim();

        #[cfg(unix)]
        {
            if let Some(path) = endpoint.strip_prefix("unix:") {
                return Ok(Endpoint::Unix(camino::Utf8PathBuf::from(path)));
            }
            if endpoint.starts_with('/') {
                return Ok(Endpoint::Unix(camino::Utf8PathBuf::from(endpoint)));
            }
        }

        if let Some(rest) = endpoint.strip_prefix("tcp://") {
            return Ok(Endpoint::Tcp(rest.to_string()));
        }

        if endpoint.contains("://") {
            eyre::bail!(
                "unsupported endpoint scheme (expected tcp://, unix:, or host:port): {}",
                endpoint
            );
        }

        Ok(Endpoint::Tcp(endpoint.to_string()))
    }

    pub fn display(&self) -> String {
        match self {
            Endpoint::Tcp(addr) => addr.clone(),
            #[cfg(unix)]
            Endpoint::Unix(path) => format!("unix:{}", path),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// A stream that can be either TCP or Unix socket
pub enum Stream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Unix(tokio::net::UnixStream),
}

impl Stream {
    /// Uid of the peer process, for Unix sockets (SO_PEERCRED).
    ///
    /// Returns None for TCP streams, where no kernel-verified identity exists.
    #[cfg(unix)]
    pub fn peer_uid(&self) -> Option<u32> {
        use std::os::unix::io::AsRawFd;

        let Stream::Unix(s) = self else {
            return None;
        };

        let fd = s.as_raw_fd();
        let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                &mut cred as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return None;
        }
        Some(cred.uid)
    }

    #[cfg(not(unix))]
    pub fn peer_uid(&self) -> Option<u32> {
        None
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connect to an endpoint
pub async fn connect(endpoint: &Endpoint) -> Result<Stream> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            Ok(Stream::Tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path.as_std_path()).await?;
            Ok(Stream::Unix(stream))
        }
    }
}

/// A listener that can accept connections from an endpoint
pub enum Listener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

impl Listener {
    /// Bind to an endpoint.
    ///
    /// For Unix sockets, removes a stale socket file and creates parent
    /// directories first.
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let listener = tokio::net::UnixListener::bind(path.as_std_path())?;
                Ok(Listener::Unix(listener))
            }
        }
    }

    /// Accept a connection, returning the stream and peer address string
    pub async fn accept(&self) -> Result<(Stream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Stream::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                Ok((Stream::Unix(stream), "unix".to_string()))
            }
        }
    }

    pub fn local_addr(&self) -> Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp(addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let addr = listener.local_addr()?;
                if let Some(path) = addr.as_pathname() {
                    Ok(Endpoint::Unix(camino::Utf8PathBuf::try_from(
                        path.to_path_buf(),
                    )?))
                } else {
                    eyre::bail!("Unix socket has no pathname")
                }
            }
        }
    }
}

/// Default IPC socket path for the daemon within its home directory
#[cfg(unix)]
pub fn default_ipc_endpoint(lynx_home: &Utf8Path) -> Endpoint {
    Endpoint::Unix(lynx_home.join("ipc.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tcp_forms() {
        assert!(matches!(
            Endpoint::parse("127.0.0.1:8088").unwrap(),
            Endpoint::Tcp(_)
        ));
        assert!(matches!(
            Endpoint::parse("tcp://localhost:80").unwrap(),
            Endpoint::Tcp(_)
        ));
        assert!(Endpoint::parse("http://x").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn parse_unix_forms() {
        assert!(matches!(
            Endpoint::parse("unix:/tmp/lx.sock").unwrap(),
            Endpoint::Unix(_)
        ));
        assert!(matches!(
            Endpoint::parse("/tmp/lx.sock").unwrap(),
            Endpoint::Unix(_)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_peer_uid_is_own_uid() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(dir.path().join("s.sock")).unwrap();
        let listener = Listener::bind(&Endpoint::Unix(path.clone())).await.unwrap();

        let client = tokio::spawn(async move {
            let _stream = connect(&Endpoint::Unix(path)).await.unwrap();
            // keep the socket open until the server has checked creds
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        });

        let (stream, _) = listener.accept().await.unwrap();
        let uid = stream.peer_uid().expect("peer uid");
        assert_eq!(uid, unsafe { libc::getuid() });
        client.await.unwrap();
    }
}
