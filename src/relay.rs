use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread,
};

use bytes::BytesMut;
use log::{debug, error, info, warn};
use threadpool::ThreadPool;

use crate::{
    target::{ResolveError, TargetInfo},
    Config,
};

/// Upper bound of the first read, the only chunk inspected for a target.
pub const FIRST_CHUNK_SIZE: usize = 16 * 1024;
/// Copy buffer of each splice direction.
pub const RELAY_BUFFER_SIZE: usize = 32 * 1024;
pub const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    Client,
    Server,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Client => f.write_str("client to proxy"),
            Leg::Server => f.write_str("proxy to server"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error(transparent)]
    Malformed(#[from] ResolveError),

    #[error("trying to proxy the proxy server itself [host = {host}, port = {port}]")]
    SelfLoop { host: String, port: u16 },

    #[error("failed to connect to {target}")]
    DownstreamConnect {
        target: TargetInfo,
        #[source]
        source: io::Error,
    },

    #[error("{leg} socket error")]
    Socket {
        leg: Leg,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind the proxy listener")]
    Bind(#[source] io::Error),
}

impl RelayError {
    fn socket(leg: Leg) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Socket { leg, source }
    }

    /// Errors the client is told about before its connection is closed.
    pub fn is_client_visible(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::SelfLoop { .. })
    }
}

/// Opens downstream connections.
pub trait Dialer {
    fn dial(&self, target: &TargetInfo) -> io::Result<TcpStream>;
}

pub struct TcpDialer;

impl Dialer for TcpDialer {
    fn dial(&self, target: &TargetInfo) -> io::Result<TcpStream> {
        TcpStream::connect((target.host.as_str(), target.port))
    }
}

/// Resolves the first chunk and refuses targets pointing back at this proxy.
pub fn check_target(first: &[u8], config: &Config) -> Result<TargetInfo, RelayError> {
    let target = TargetInfo::resolve(first)?;
    if config.is_self(&target.host, target.port) {
        return Err(RelayError::SelfLoop {
            host: target.host,
            port: target.port,
        });
    }
    Ok(target)
}

/// Echoes the offending request and the error back to the client.
fn reject(client: &mut TcpStream, first: &[u8], err: &RelayError) -> io::Result<()> {
    client.write_all(b"Received request:\n")?;
    client.write_all(first)?;
    client.write_all(b"\n")?;
    client.write_all(format!("Error info: {err}").as_bytes())?;
    client.flush()
}

/// Runs one relay session until either side is done.
pub fn handle<D: Dialer>(
    mut client: TcpStream,
    config: &Config,
    dialer: &D,
) -> Result<(), RelayError> {
    let mut first = BytesMut::zeroed(FIRST_CHUNK_SIZE);
    let nbytes = client
        .read(&mut first)
        .map_err(RelayError::socket(Leg::Client))?;
    if nbytes == 0 {
        debug!("client disconnected before sending a request");
        return Ok(());
    }
    first.truncate(nbytes);
    let first = first.freeze();

    let target = match check_target(&first, config) {
        Ok(target) => target,
        Err(e) => {
            if let Err(io_err) = reject(&mut client, &first, &e) {
                debug!("failed to report rejection to client: {io_err}");
            }
            let _ = client.shutdown(Shutdown::Both);
            return Err(e);
        }
    };
    info!("connection info: {target} (tunnel = {})", target.is_tunnel);

    let mut server = dialer
        .dial(&target)
        .map_err(|source| RelayError::DownstreamConnect {
            target: target.clone(),
            source,
        })?;
    debug!("proxy to server set up for {target}");

    if target.is_tunnel {
        debug!("tunnel request: {}", String::from_utf8_lossy(&first));
        client
            .write_all(TUNNEL_ESTABLISHED)
            .map_err(RelayError::socket(Leg::Client))?;
    } else {
        debug!("http request: {}", String::from_utf8_lossy(&first));
        server
            .write_all(&first)
            .map_err(RelayError::socket(Leg::Server))?;
    }

    splice(client, server)
}

/// Relays bytes both ways until one direction ends, then closes both sockets.
fn splice(client: TcpStream, server: TcpStream) -> Result<(), RelayError> {
    let client_reader = client.try_clone().map_err(RelayError::socket(Leg::Client))?;
    let server_reader = server.try_clone().map_err(RelayError::socket(Leg::Server))?;

    let (upstream, downstream) = thread::scope(|s| {
        let up = s.spawn(|| pipe(client_reader, &server, Leg::Client, Leg::Server));
        let down = pipe(server_reader, &client, Leg::Server, Leg::Client);
        let up = up.join().unwrap_or(Ok(0));
        (up, down)
    });

    match (upstream, downstream) {
        (Ok(up), Ok(down)) => {
            debug!("session closed: {up} bytes up, {down} bytes down");
            Ok(())
        }
        (Err(e), _) | (_, Err(e)) => Err(e),
    }
}

fn pipe(
    mut from: TcpStream,
    mut to: &TcpStream,
    from_leg: Leg,
    to_leg: Leg,
) -> Result<u64, RelayError> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;
    let result = loop {
        let nbytes = match from.read(&mut buf) {
            Ok(0) => break Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(RelayError::socket(from_leg)(e)),
        };
        if let Err(e) = to.write_all(&buf[..nbytes]) {
            break Err(RelayError::socket(to_leg)(e));
        }
        total += nbytes as u64;
    };
    // Either direction ending ends the session.
    let _ = to.shutdown(Shutdown::Both);
    let _ = from.shutdown(Shutdown::Both);
    result
}

/// Accepts clients and relays each one on the worker pool.
pub struct Proxy {
    config: Arc<Config>,
    listener: TcpListener,
    pool: ThreadPool,
}

impl Proxy {
    pub fn bind(mut config: Arc<Config>) -> Result<Proxy, RelayError> {
        let listener =
            TcpListener::bind((config.host.as_str(), config.port)).map_err(RelayError::Bind)?;
        // An ephemeral port is only known once bound; the self-loop guard needs the real one.
        let bound = listener.local_addr().map_err(RelayError::Bind)?.port();
        if bound != config.port {
            Arc::make_mut(&mut config).port = bound;
        }
        let pool = ThreadPool::with_name("relay".into(), config.workers.max(1));
        Ok(Self {
            config,
            listener,
            pool,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&self) {
        for stream in self.listener.incoming() {
            let client = match stream {
                Ok(client) => client,
                Err(e) => {
                    warn!("failed to accept client connection");
                    debug!("{e}");
                    continue;
                }
            };
            match client.peer_addr() {
                Ok(peer) => info!("client connected to proxy: {peer}"),
                Err(_) => info!("client connected to proxy"),
            }
            let config = Arc::clone(&self.config);
            self.pool.execute(move || {
                if let Err(e) = handle(client, &config, &TcpDialer) {
                    error!("{e}");
                    if let Some(source) = std::error::Error::source(&e) {
                        debug!("caused by: {source}");
                    }
                }
            });
        }
    }
}
