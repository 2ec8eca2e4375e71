use mio::{
    Events, Interest, Token, Waker,
    net::{TcpListener, TcpStream},
};
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, IsTerminal, Write},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::Configuration;

/// Remote collectors connect to this address on `--log-service-port`.
pub const COLLECTOR_HOST: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

const ACCEPT: Token = Token(0);
const WAKE: Token = Token(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Default,
    File(PathBuf),
    Tcp { host: IpAddr, port: u16 },
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkKind::Default => write!(f, "stderr"),
            SinkKind::File(path) => write!(f, "file {}", path.display()),
            SinkKind::Tcp { host, port } => write!(f, "tcp collectors on {}:{}", host, port),
        }
    }
}

#[derive(Clone)]
enum Target {
    Stderr,
    File(Arc<File>),
    Tcp(Arc<Collector>),
}

/// Destination for diagnostic output. Cheap to clone; the file or collector
/// socket is released when the last clone is dropped.
#[derive(Clone)]
pub struct LogSink {
    kind: SinkKind,
    target: Target,
    fallbacks: Arc<[String]>,
}

impl LogSink {
    pub fn stderr() -> Self {
        LogSink {
            kind: SinkKind::Default,
            target: Target::Stderr,
            fallbacks: Arc::from([]),
        }
    }

    pub fn kind(&self) -> &SinkKind {
        &self.kind
    }

    /// Why higher priority destinations were skipped, in policy order.
    pub fn fallbacks(&self) -> &[String] {
        &self.fallbacks
    }

    /// True only when lines go to stderr and stderr is a tty.
    pub fn is_terminal(&self) -> bool {
        matches!(self.target, Target::Stderr) && io::stderr().is_terminal()
    }
}

/// Picks the log destination: the log file if it can be created, else a TCP
/// collector port, else stderr. Never fails.
pub fn select(config: &Configuration) -> LogSink {
    let mut fallbacks = Vec::new();

    if let Some(path) = config.log_file.as_deref().filter(|p| !p.is_empty()) {
        match open_log_file(path) {
            Ok(file) => {
                return LogSink {
                    kind: SinkKind::File(PathBuf::from(path)),
                    target: Target::File(Arc::new(file)),
                    fallbacks: fallbacks.into(),
                };
            }
            Err(e) => fallbacks.push(format!("log file {}: {}", path, e)),
        }
    }

    if let Some(port) = config.log_port.filter(|&p| p > 0) {
        match Collector::bind(SocketAddr::new(COLLECTOR_HOST, port)) {
            Ok(collector) => {
                return LogSink {
                    kind: SinkKind::Tcp {
                        host: COLLECTOR_HOST,
                        port,
                    },
                    target: Target::Tcp(Arc::new(collector)),
                    fallbacks: fallbacks.into(),
                };
            }
            Err(e) => fallbacks.push(format!("log service port {}: {}", port, e)),
        }
    }

    LogSink {
        fallbacks: fallbacks.into(),
        ..LogSink::stderr()
    }
}

fn open_log_file(path: &str) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

/// Fans every log line out to the connected collectors. Peers are
/// non-blocking; one whose socket buffer cannot take a whole line is
/// disconnected rather than stalling the logging thread.
pub struct Collector {
    peers: Arc<Mutex<Vec<TcpStream>>>,
    waker: Waker,
    thread: Option<JoinHandle<()>>,
}

impl Collector {
    fn bind(addr: SocketAddr) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;

        let mut poll = mio::Poll::new()?;
        poll.registry()
            .register(&mut listener, ACCEPT, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKE)?;

        let peers = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::clone(&peers);
        let thread = thread::Builder::new()
            .name("log-collector".into())
            .spawn(move || accept_loop(&mut poll, &listener, &accepted))?;

        Ok(Collector {
            peers,
            waker,
            thread: Some(thread),
        })
    }

    fn broadcast(&self, buf: &[u8]) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.retain_mut(|peer| offer(peer, buf));
    }

    #[cfg(test)]
    fn peer_count(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Writes the whole line or reports the peer as gone. A short write would
/// leave a torn line on the wire, so it counts as gone too.
fn offer(peer: &mut TcpStream, buf: &[u8]) -> bool {
    loop {
        match peer.write(buf) {
            Ok(n) => return n == buf.len(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

fn accept_loop(poll: &mut mio::Poll, listener: &TcpListener, peers: &Mutex<Vec<TcpStream>>) {
    let mut events = Events::with_capacity(8);
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        for event in events.iter() {
            if event.token() == WAKE {
                return;
            }
            while let Ok((peer, _)) = listener.accept() {
                peers.lock().unwrap_or_else(|e| e.into_inner()).push(peer);
            }
        }
    }
}

pub enum SinkWriter<'a> {
    Stderr(io::Stderr),
    File(&'a File),
    Tcp(&'a Collector),
}

impl Write for SinkWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkWriter::Stderr(out) => out.write(buf),
            SinkWriter::File(file) => file.write(buf),
            SinkWriter::Tcp(collector) => {
                collector.broadcast(buf);
                Ok(buf.len())
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkWriter::Stderr(out) => out.flush(),
            SinkWriter::File(file) => file.flush(),
            SinkWriter::Tcp(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match &self.target {
            Target::Stderr => SinkWriter::Stderr(io::stderr()),
            Target::File(file) => SinkWriter::File(file),
            Target::Tcp(collector) => SinkWriter::Tcp(collector),
        }
    }
}
