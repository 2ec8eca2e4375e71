use bytes::BytesMut;
use mio::{
    Events, Interest, Registry, Token, Waker,
    event::Source,
    net::{TcpListener, TcpStream, UnixListener, UnixStream},
};
use std::{
    collections::HashMap,
    fs,
    io::{self, Read},
    net::{SocketAddr, ToSocketAddrs},
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{bootstrap::Listen, dispatcher::Dispatcher};

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Address {
    /// Accepts `unix:<path>` and `tcp://<host>:<port>[/]`.
    pub fn parse(uri: &str) -> Option<Self> {
        if let Some(path) = uri.strip_prefix("unix:") {
            return (!path.is_empty()).then(|| Address::Unix(PathBuf::from(path)));
        }
        let host_port = uri.strip_prefix("tcp://")?.trim_end_matches('/');
        host_port
            .to_socket_addrs()
            .ok()?
            .next()
            .map(Address::Tcp)
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Listener {
    fn bind(address: &Address) -> io::Result<Self> {
        match address {
            Address::Tcp(addr) => TcpListener::bind(*addr).map(Listener::Tcp),
            Address::Unix(path) => {
                remove_stale_socket(path)?;
                UnixListener::bind(path).map(Listener::Unix)
            }
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Tcp(l) => l.accept().map(|(s, _)| Stream::Tcp(s)),
            Listener::Unix(l) => l.accept().map(|(s, _)| Stream::Unix(s)),
        }
    }
}

macro_rules! delegate_source {
    ($ty:ident) => {
        impl Source for $ty {
            fn register(
                &mut self,
                registry: &Registry,
                token: Token,
                interests: Interest,
            ) -> io::Result<()> {
                match self {
                    $ty::Tcp(s) => s.register(registry, token, interests),
                    $ty::Unix(s) => s.register(registry, token, interests),
                }
            }

            fn reregister(
                &mut self,
                registry: &Registry,
                token: Token,
                interests: Interest,
            ) -> io::Result<()> {
                match self {
                    $ty::Tcp(s) => s.reregister(registry, token, interests),
                    $ty::Unix(s) => s.reregister(registry, token, interests),
                }
            }

            fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
                match self {
                    $ty::Tcp(s) => s.deregister(registry),
                    $ty::Unix(s) => s.deregister(registry),
                }
            }
        }
    };
}

delegate_source!(Listener);
delegate_source!(Stream);

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// An accepted stream and its read buffer. Messages are split off the
/// front of `buf`, so consecutive reads share one allocation until it runs
/// low; once every message cut from it is dropped `reserve` reclaims it.
struct Connection {
    stream: Stream,
    buf: BytesMut,
}

impl Connection {
    fn new(stream: Stream) -> Self {
        Connection {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Keeps at least half a message worth of room ahead of the next read.
    fn refill(&mut self, msg_buf_size: usize) {
        if self.buf.len() * 2 < msg_buf_size {
            self.buf.clear();
            self.buf.resize(msg_buf_size, 0);
        }
    }
}

struct Running {
    waker: Waker,
    thread: JoinHandle<()>,
}

/// A transport endpoint feeding the shared dispatcher. Every read from a
/// connection is handed over as one message.
pub struct Poll {
    address: Address,
    uri: Arc<str>,
    local_addr: Option<SocketAddr>,
    running: Option<Running>,
}

impl Poll {
    pub fn new(uri: &str) -> Option<Self> {
        Address::parse(uri).map(|address| Poll {
            address,
            uri: Arc::from(uri),
            local_addr: None,
            running: None,
        })
    }

    /// Bound TCP address, which differs from the configured one for port 0.
    #[cfg(test)]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Listen<Dispatcher> for Poll {
    fn start(&mut self, dispatcher: &Arc<Dispatcher>) -> io::Result<()> {
        if self.running.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already started", self.uri),
            ));
        }

        let mut listener = Listener::bind(&self.address)?;
        if let Listener::Tcp(l) = &listener {
            self.local_addr = Some(l.local_addr()?);
        }

        let poll = mio::Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER)?;

        let dispatcher = Arc::clone(dispatcher);
        let uri = Arc::clone(&self.uri);
        let thread = thread::Builder::new()
            .name(format!("poll {}", self.uri))
            .spawn(move || event_loop(poll, listener, dispatcher, uri))?;

        match self.local_addr {
            Some(addr) => info!("Listening on {} ({})", self.uri, addr),
            None => info!("Listening on {}", self.uri),
        }
        self.running = Some(Running { waker, thread });
        Ok(())
    }

    fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        if let Err(e) = running.waker.wake() {
            error!("Failed to wake poll {}: {}", self.uri, e);
        }
        if running.thread.join().is_err() {
            error!("Poll thread for {} panicked", self.uri);
        }
        if let Address::Unix(path) = &self.address {
            let _ = fs::remove_file(path);
        }
        info!("Stopped listening on {}", self.uri);
    }
}

impl Drop for Poll {
    fn drop(&mut self) {
        self.stop();
    }
}

fn event_loop(
    mut poll: mio::Poll,
    listener: Listener,
    dispatcher: Arc<Dispatcher>,
    uri: Arc<str>,
) {
    let mut events = Events::with_capacity(256);
    let mut connections: HashMap<Token, Connection> = HashMap::new();
    let mut next_token = FIRST_CONNECTION;

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            error!("Poll on {} failed: {}", uri, e);
            return;
        }

        for event in events.iter() {
            match event.token() {
                WAKER => return,
                LISTENER => loop {
                    match listener.accept() {
                        Ok(mut stream) => {
                            let token = Token(next_token);
                            next_token += 1;
                            let registered =
                                poll.registry()
                                    .register(&mut stream, token, Interest::READABLE);
                            match registered {
                                Ok(()) => {
                                    debug!("Accepted connection on {}", uri);
                                    connections.insert(token, Connection::new(stream));
                                }
                                Err(e) => {
                                    warn!("Failed to register connection on {}: {}", uri, e)
                                }
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                        Err(e) => {
                            warn!("Accept on {} failed: {}", uri, e);
                            break;
                        }
                    }
                },
                token => {
                    let closed = match connections.get_mut(&token) {
                        Some(conn) => drain(conn, &dispatcher, &uri),
                        None => false,
                    };
                    if closed {
                        if let Some(mut conn) = connections.remove(&token) {
                            let _ = poll.registry().deregister(&mut conn.stream);
                        }
                        debug!("Connection on {} closed", uri);
                    }
                }
            }
        }
    }
}

/// Reads until the socket would block. Returns true once the peer is gone.
fn drain(conn: &mut Connection, dispatcher: &Dispatcher, uri: &Arc<str>) -> bool {
    loop {
        conn.refill(dispatcher.msg_buf_size());
        match conn.stream.read(&mut conn.buf) {
            Ok(0) => return true,
            Ok(n) => {
                let message = conn.buf.split_to(n).freeze();
                dispatcher.deliver(uri, message);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Connection read error on {}: {}", uri, e);
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bootstrap::DispatcherFlags,
        dispatcher::{StopSignal, wait_for},
    };
    use std::io::Write;

    fn dispatcher() -> Arc<Dispatcher> {
        sized_dispatcher(0)
    }

    fn sized_dispatcher(msg_buf_size: u32) -> Arc<Dispatcher> {
        Arc::new(
            Dispatcher::new(
                DispatcherFlags::default(),
                msg_buf_size,
                Arc::new(StopSignal::default()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_address_parsing() {
        assert_eq!(
            Address::parse("unix:/run/dispatchd.sock"),
            Some(Address::Unix(PathBuf::from("/run/dispatchd.sock")))
        );
        assert_eq!(
            Address::parse("tcp://127.0.0.1:2517/"),
            Some(Address::Tcp("127.0.0.1:2517".parse().unwrap()))
        );
        assert_eq!(
            Address::parse("tcp://0.0.0.0:0"),
            Some(Address::Tcp("0.0.0.0:0".parse().unwrap()))
        );
        assert_eq!(Address::parse("unix:"), None);
        assert_eq!(Address::parse("tcp://127.0.0.1"), None);
        assert_eq!(Address::parse("udp://127.0.0.1:53"), None);
        assert_eq!(Address::parse("addr-A"), None);
        assert!(Poll::new("garbage").is_none());
    }

    #[test]
    fn test_tcp_poll_delivers_to_dispatcher() {
        let d = dispatcher();
        let mut poll = Poll::new("tcp://127.0.0.1:0/").unwrap();
        poll.start(&d).unwrap();
        let addr = poll.local_addr().unwrap();

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"ping").unwrap();
        client.flush().unwrap();

        assert!(wait_for(|| d.counters().bytes == 4));
        assert!(poll.start(&d).is_err());

        poll.stop();
        poll.stop();
        assert!(std::net::TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_unix_poll_replaces_stale_socket_and_cleans_up() {
        let path =
            std::env::temp_dir().join(format!("dispatchd-poll-{}.sock", std::process::id()));
        let _ = fs::remove_file(&path);
        // leftover from a previous run
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let d = dispatcher();
        let mut poll = Poll::new(&format!("unix:{}", path.display())).unwrap();
        poll.start(&d).unwrap();

        let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        client.write_all(b"hello dispatcher").unwrap();
        assert!(wait_for(|| d.counters().bytes == 16));

        poll.stop();
        assert!(!path.exists());
    }

    #[test]
    fn test_unix_poll_refuses_regular_file() {
        let path =
            std::env::temp_dir().join(format!("dispatchd-poll-{}.txt", std::process::id()));
        fs::write(&path, b"not a socket").unwrap();

        let mut poll = Poll::new(&format!("unix:{}", path.display())).unwrap();
        let err = poll.start(&dispatcher()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_reads_share_one_connection_buffer() {
        let d = sized_dispatcher(1 << 20);
        let uri: Arc<str> = Arc::from("unix:pair");
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = Connection::new(Stream::Unix(server));

        assert!(!drain(&mut conn, &d, &uri));
        let start = conn.buf.as_ptr() as usize;
        assert_eq!(conn.buf.len(), 1 << 20);

        client.write_all(b"one").unwrap();
        assert!(!drain(&mut conn, &d, &uri));
        assert!(wait_for(|| d.counters().messages == 1));
        client.write_all(b"three").unwrap();
        assert!(!drain(&mut conn, &d, &uri));
        assert!(wait_for(|| d.counters().messages == 2));

        // both messages were cut from the first allocation
        assert_eq!(conn.buf.as_ptr() as usize - start, 8);
        assert_eq!(d.counters().bytes, 8);

        drop(client);
        assert!(drain(&mut conn, &d, &uri));
    }
}
