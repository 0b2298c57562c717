//! Shared fixtures for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use sqlconn::tunnel::{InstanceName, TunnelStream};
use sqlconn::{DialerFactory, DialerFamily, DialerOptions, TunnelDialer};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const SSL_REQUEST: i32 = 80877103;
const GSSENC_REQUEST: i32 = 80877104;

/// Minimal Postgres backend: trusts every login, answers Sync and simple queries.
pub struct FakePostgres {
    addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl FakePostgres {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let sessions = Arc::new(AtomicUsize::new(0));
        let counter = sessions.clone();

        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = serve(socket).await;
                });
            }
        });

        Self {
            addr,
            sessions,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Backend sessions accepted so far
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl Drop for FakePostgres {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn message(out: &mut Vec<u8>, tag: u8, body: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
}

fn cstrings(parts: &[&str]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(part.as_bytes());
        body.push(0);
    }
    body
}

async fn serve(mut socket: TcpStream) -> io::Result<()> {
    // Startup, possibly preceded by encryption requests we decline.
    loop {
        let len = socket.read_i32().await? as usize;
        let mut body = vec![0u8; len.saturating_sub(4)];
        socket.read_exact(&mut body).await?;
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        if code == SSL_REQUEST || code == GSSENC_REQUEST {
            socket.write_all(b"N").await?;
            continue;
        }
        break;
    }

    let mut out = Vec::new();
    message(&mut out, b'R', &0i32.to_be_bytes());
    message(&mut out, b'S', &cstrings(&["server_version", "16.0"]));
    message(&mut out, b'S', &cstrings(&["client_encoding", "UTF8"]));
    message(&mut out, b'K', &[0, 0, 0, 1, 0, 0, 0, 2]);
    message(&mut out, b'Z', b"I");
    socket.write_all(&out).await?;

    loop {
        let tag = match socket.read_u8().await {
            Ok(tag) => tag,
            Err(_) => return Ok(()),
        };
        let len = socket.read_i32().await? as usize;
        let mut body = vec![0u8; len.saturating_sub(4)];
        socket.read_exact(&mut body).await?;

        match tag {
            b'S' => {
                let mut out = Vec::new();
                message(&mut out, b'Z', b"I");
                socket.write_all(&out).await?;
            }
            b'Q' => {
                let mut out = Vec::new();
                message(&mut out, b'C', &cstrings(&["SELECT 0"]));
                message(&mut out, b'Z', b"I");
                socket.write_all(&out).await?;
            }
            b'X' => return Ok(()),
            _ => {}
        }
    }
}

/// Minimal MySQL server: accepts any login, answers commands with OK.
pub struct FakeMySql {
    addr: SocketAddr,
    sessions: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl FakeMySql {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let sessions = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (counter, seen) = (sessions.clone(), commands.clone());

        let task = tokio::spawn(async move {
            let mut id = 0u32;
            while let Ok((socket, _)) = listener.accept().await {
                id += 1;
                counter.fetch_add(1, Ordering::SeqCst);
                let seen = seen.clone();
                tokio::spawn(async move {
                    let _ = serve_mysql(socket, id, seen).await;
                });
            }
        });

        Self {
            addr,
            sessions,
            commands,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Command bytes received after login, in arrival order
    pub fn commands(&self) -> Vec<u8> {
        self.commands.lock().unwrap().clone()
    }
}

impl Drop for FakeMySql {
    fn drop(&mut self) {
        self.task.abort();
    }
}

const COM_QUIT: u8 = 0x01;

async fn write_packet(socket: &mut TcpStream, seq: u8, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.extend_from_slice(&len.to_le_bytes()[..3]);
    out.push(seq);
    out.extend_from_slice(payload);
    socket.write_all(&out).await
}

async fn read_packet(socket: &mut TcpStream) -> io::Result<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    socket.read_exact(&mut header).await?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let mut payload = vec![0u8; len];
    socket.read_exact(&mut payload).await?;
    Ok((header[3], payload))
}

fn ok_packet() -> Vec<u8> {
    // header, affected rows, last insert id, status (autocommit), warnings
    vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
}

async fn serve_mysql(mut socket: TcpStream, id: u32, seen: Arc<Mutex<Vec<u8>>>) -> io::Result<()> {
    let mut hello = vec![0x0a];
    hello.extend_from_slice(b"8.0.36\0");
    hello.extend_from_slice(&id.to_le_bytes());
    hello.extend_from_slice(b"abcdefgh");
    hello.push(0);
    hello.extend_from_slice(&0xA20Fu16.to_le_bytes());
    hello.push(255);
    hello.extend_from_slice(&0x0002u16.to_le_bytes());
    hello.extend_from_slice(&0x002Bu16.to_le_bytes());
    hello.push(21);
    hello.extend_from_slice(&[0u8; 10]);
    hello.extend_from_slice(b"ijklmnopqrst\0");
    hello.extend_from_slice(b"mysql_native_password\0");
    write_packet(&mut socket, 0, &hello).await?;

    let (seq, _login) = read_packet(&mut socket).await?;
    write_packet(&mut socket, seq.wrapping_add(1), &ok_packet()).await?;

    loop {
        let (_, command) = match read_packet(&mut socket).await {
            Ok(packet) => packet,
            Err(_) => return Ok(()),
        };
        let Some(&code) = command.first() else {
            continue;
        };
        seen.lock().unwrap().push(code);
        if code == COM_QUIT {
            return Ok(());
        }
        // COM_QUERY, COM_PING and anything else get a bare OK.
        write_packet(&mut socket, 1, &ok_packet()).await?;
    }
}

/// Listener that accepts connections and never answers.
///
/// Counts accepted sockets and the ones the client has since closed.
pub struct BlackHole {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl BlackHole {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let (accepts, closes) = (accepted.clone(), closed.clone());

        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepts.fetch_add(1, Ordering::SeqCst);
                let closes = closes.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 512];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {}
                        }
                    }
                    closes.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        Self {
            addr,
            accepted,
            closed,
            task,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Sockets the client has closed
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait up to `limit` for every accepted socket to be closed by the client
    pub async fn wait_all_closed(&self, limit: std::time::Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.closed() == self.accepted() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.closed() == self.accepted()
    }
}

impl Drop for BlackHole {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Counters shared by [`LoopbackFactory`] and its dialers.
#[derive(Debug, Clone, Default)]
pub struct DialerCounts {
    pub created: Arc<AtomicUsize>,
    pub dials: Arc<AtomicUsize>,
    pub closed: Arc<AtomicUsize>,
}

impl DialerCounts {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory whose dialers open plain TCP to a fixed address.
pub struct LoopbackFactory {
    pub target: SocketAddr,
    pub counts: DialerCounts,
    pub fail: bool,
}

impl LoopbackFactory {
    pub fn new(target: SocketAddr) -> (Self, DialerCounts) {
        let counts = DialerCounts::default();
        (
            Self {
                target,
                counts: counts.clone(),
                fail: false,
            },
            counts,
        )
    }
}

#[async_trait]
impl DialerFactory for LoopbackFactory {
    async fn create(
        &self,
        _family: DialerFamily,
        _options: &DialerOptions,
    ) -> sqlconn::Result<Arc<dyn TunnelDialer>> {
        self.counts.created.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(sqlconn::Error::Config("no default credentials".into()));
        }
        Ok(Arc::new(LoopbackDialer {
            target: self.target,
            counts: self.counts.clone(),
        }))
    }
}

struct LoopbackDialer {
    target: SocketAddr,
    counts: DialerCounts,
}

#[async_trait]
impl TunnelDialer for LoopbackDialer {
    async fn dial(&self, _instance: &InstanceName) -> sqlconn::Result<TunnelStream> {
        self.counts.dials.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect(self.target).await?;
        Ok(Box::new(stream))
    }

    async fn close(&self) -> sqlconn::Result<()> {
        self.counts.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory sink for formatted `tracing` output.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync + 'static {
        let sink = self.clone();
        tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish()
    }

    /// Run `f` with a subscriber writing into this capture
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        tracing::subscriber::with_default(self.subscriber(), f)
    }

    /// Capture on the current thread until the guard drops
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(self.subscriber())
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
