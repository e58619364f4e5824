use std::{io, net::SocketAddr, path::Path};

use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{stream::Stream, AsyncReadRent, AsyncWriteRent, Split},
    net::{ListenerOpts, TcpListener, TcpStream},
    BufResult,
};
use service_async::MakeService;

use crate::config::ListenerSpec;

pub enum ListenerBuilder {
    Tcp(SocketAddr, ListenerOpts),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener),
}

impl ListenerBuilder {
    #[cfg(unix)]
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<ListenerBuilder> {
        // Try remove file first
        let _ = std::fs::remove_file(path.as_ref());
        let listener = std::os::unix::net::UnixListener::bind(path)?;
        // Because we use std and build async UnixStream from raw fd, we
        // have to make sure it is non_blocking.
        if monoio::utils::is_legacy() {
            listener.set_nonblocking(true)?;
        }
        Ok(Self::Unix(listener))
    }

    pub fn bind_tcp(addr: SocketAddr, opts: ListenerOpts) -> io::Result<ListenerBuilder> {
        Ok(Self::Tcp(addr, opts))
    }

    pub fn build(&self) -> io::Result<Listener> {
        match self {
            ListenerBuilder::Tcp(addr, opts) => {
                TcpListener::bind_with_config(addr, opts).map(Listener::Tcp)
            }
            #[cfg(unix)]
            ListenerBuilder::Unix(listener) => {
                let sys_listener = listener.try_clone()?;
                monoio::net::UnixListener::from_std(sys_listener).map(Listener::Unix)
            }
        }
    }
}

impl TryFrom<&ListenerSpec> for ListenerBuilder {
    type Error = io::Error;

    fn try_from(spec: &ListenerSpec) -> io::Result<Self> {
        match spec {
            ListenerSpec::SocketAddress(sa) => {
                ListenerBuilder::bind_tcp(sa.socket_addr, ListenerOpts::default())
            }
            #[cfg(unix)]
            ListenerSpec::Uds(uds) => ListenerBuilder::bind_unix(&uds.uds_path),
            #[cfg(not(unix))]
            ListenerSpec::Uds(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain listeners are not supported on this platform",
            )),
        }
    }
}

impl MakeService for ListenerBuilder {
    type Service = Listener;
    type Error = io::Error;

    fn make_via_ref(&self, _old: Option<&Self::Service>) -> Result<Self::Service, Self::Error> {
        self.build()
    }
}

/// Unified listener.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(monoio::net::UnixListener),
}

impl Listener {
    pub fn local_addr(&self) -> io::Result<AcceptedAddr> {
        match self {
            Listener::Tcp(l) => l.local_addr().map(AcceptedAddr::Tcp),
            #[cfg(unix)]
            Listener::Unix(l) => l.local_addr().map(AcceptedAddr::Unix),
        }
    }
}

impl Stream for Listener {
    type Item = io::Result<(AcceptedStream, AcceptedAddr)>;

    async fn next(&mut self) -> Option<Self::Item> {
        match self {
            Listener::Tcp(l) => match l.next().await {
                Some(Ok(accepted)) => Some(Ok((
                    AcceptedStream::Tcp(accepted.0),
                    AcceptedAddr::Tcp(accepted.1),
                ))),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
            #[cfg(unix)]
            Listener::Unix(l) => match l.next().await {
                Some(Ok(accepted)) => Some(Ok((
                    AcceptedStream::Unix(accepted.0),
                    AcceptedAddr::Unix(accepted.1),
                ))),
                Some(Err(e)) => Some(Err(e)),
                None => None,
            },
        }
    }
}

pub enum AcceptedStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(monoio::net::UnixStream),
}

unsafe impl Split for AcceptedStream {}

#[derive(Debug, Clone)]
pub enum AcceptedAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(monoio::net::unix::SocketAddr),
}

impl From<SocketAddr> for AcceptedAddr {
    fn from(value: SocketAddr) -> Self {
        Self::Tcp(value)
    }
}

#[cfg(unix)]
impl From<monoio::net::unix::SocketAddr> for AcceptedAddr {
    fn from(value: monoio::net::unix::SocketAddr) -> Self {
        Self::Unix(value)
    }
}

impl AsyncReadRent for AcceptedStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.read(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.readv(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for AcceptedStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.write(buf).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.write(buf).await,
        }
    }

    async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
        match self {
            AcceptedStream::Tcp(inner) => inner.writev(buf_vec).await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.writev(buf_vec).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.flush().await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            AcceptedStream::Tcp(inner) => inner.shutdown().await,
            #[cfg(unix)]
            AcceptedStream::Unix(inner) => inner.shutdown().await,
        }
    }
}
