//! Thin wiring binary: loads a config file, opens the listener and the
//! configured backend connections, and drives the response core
//! (`shard_cache_proxy::proto::{receiver,filter,sender}`) over real
//! sockets. Request parsing, key hashing, and shard selection are out
//! of scope (`spec.md` §1) — this forwards whatever bytes a client
//! sends verbatim to the pool's first healthy server, which is enough
//! to exercise the response pipeline end to end but is not a real
//! proxy's routing layer.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use clap::Parser as ClapParser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::{error, info, warn};

use shard_cache_proxy::config::Config;
use shard_cache_proxy::connection::{Connection, Protocol, Role};
use shard_cache_proxy::error::Error;
use shard_cache_proxy::memcached::MemcachedReplyParser;
use shard_cache_proxy::message::MessagePool;
use shard_cache_proxy::pool::ConnectionPool;
use shard_cache_proxy::proto::{filter, receiver, sender};
use shard_cache_proxy::slowlog::{AddrCache, ChannelSlowLogSink};
use shard_cache_proxy::topology::{ServerPool, ServerRecord};

#[derive(ClapParser, Debug)]
#[command(name = "proxyd", about = "Sharding cache proxy response pipeline")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "proxyd.toml")]
    config: std::path::PathBuf,

    /// Log level passed to `tracing_subscriber::EnvFilter` (e.g. info, debug).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let local = LocalSet::new();
    local.block_on(&rt, run(config));
}

/// Shared, process-wide state (spec.md §5) the single-threaded event
/// loop mutates through interior mutability rather than locking.
struct Core {
    connections: RefCell<ConnectionPool>,
    messages: RefCell<MessagePool>,
    addr_cache: RefCell<AddrCache>,
    slowlog: ChannelSlowLogSink,
}

/// A live backend connection: the `Connection` the response core
/// tracks, its health record, and the channel feeding its writer task.
/// Request forwarding itself is a thin byte pass-through (out of
/// scope, spec.md §1), kept separate from the `Connection`'s own
/// out-queue bookkeeping.
#[derive(Clone)]
struct Backend {
    conn: Rc<RefCell<Connection>>,
    record: Rc<RefCell<ServerRecord>>,
    request_tx: mpsc::UnboundedSender<Vec<u8>>,
}

async fn run(config: Config) {
    let (sink, mut drain_rx) = ChannelSlowLogSink::new();
    tokio::task::spawn_local(async move {
        while let Some(line) = drain_rx.recv().await {
            info!(target: "slowlog", "{}", line.trim_end());
        }
    });

    let core = Rc::new(Core {
        connections: RefCell::new(ConnectionPool::new()),
        messages: RefCell::new(MessagePool::new(4096)),
        addr_cache: RefCell::new(AddrCache::new()),
        slowlog: sink,
    });

    // Only the first configured pool is wired up: choosing among
    // multiple pools is shard-routing logic, out of scope here.
    let Some((pool_name, pool_config)) = config.pools.iter().next() else {
        error!("config has no pools configured");
        return;
    };

    let server_pool = Rc::new(RefCell::new(ServerPool::new(
        1,
        pool_name.clone(),
        pool_config.slowlog_slower_than_ms,
    )));
    server_pool.borrow_mut().slowlog_enabled = pool_config.slowlog;

    let mut backends = Vec::new();
    for (idx, server_config) in pool_config.servers.iter().enumerate() {
        match connect_backend(
            &core,
            idx as u64 + 1,
            server_config.addr,
            server_config.local_idc,
            config.protocol.into(),
            &server_pool,
        )
        .await
        {
            Ok(backend) => backends.push(backend),
            Err(e) => warn!(addr = %server_config.addr, error = %e, "failed to connect to backend"),
        }
    }

    if backends.is_empty() {
        error!(pool = %pool_name, "no reachable backends, refusing to accept clients");
        return;
    }

    let listener = match TcpListener::bind(config.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %config.listen, error = %e, "failed to bind listener");
            return;
        }
    };
    info!(addr = %config.listen, pool = %pool_name, "proxyd listening");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let core = core.clone();
        let backend = backends
            .iter()
            .find(|b| b.record.borrow().is_healthy())
            .cloned()
            .unwrap_or_else(|| backends[0].clone());
        tokio::task::spawn_local(handle_client(core, socket, peer_addr, backend, config.protocol.into()));
    }
}

async fn connect_backend(
    core: &Rc<Core>,
    id: u64,
    addr: SocketAddr,
    local_idc: bool,
    protocol: Protocol,
    pool: &Rc<RefCell<ServerPool>>,
) -> Result<Backend, Error> {
    let stream = TcpStream::connect(addr).await?;
    let record = Rc::new(RefCell::new(ServerRecord::new(id, addr, local_idc, pool.clone())));

    let conn = core.connections.borrow_mut().acquire(Role::Server, protocol, addr);
    conn.borrow_mut().server = Some(record.clone());

    let (read_half, mut write_half) = stream.into_split();
    let (request_tx, mut request_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::task::spawn_local(run_backend_reader(core.clone(), conn.clone(), read_half));
    tokio::task::spawn_local(async move {
        while let Some(bytes) = request_rx.recv().await {
            if let Err(e) = write_half.write_all(&bytes).await {
                warn!(error = %e, "backend write error");
                break;
            }
        }
    });

    Ok(Backend { conn, record, request_tx })
}

/// Reads bytes off a backend socket, parses replies, and filters/
/// forwards each one to its paired client (spec.md §4.3, §4.4).
async fn run_backend_reader(core: Rc<Core>, conn: Rc<RefCell<Connection>>, mut read_half: OwnedReadHalf) {
    let mut parser = MemcachedReplyParser::new();
    let mut buf = [0u8; 16 * 1024];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                receiver::on_eof(&conn, &mut core.messages.borrow_mut());
                sender::drain_with_error(&conn, &mut core.messages.borrow_mut());
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(server_id = conn.borrow().id, error = %e, "backend read error");
                break;
            }
        };

        let mut completed = Vec::new();
        let result = receiver::on_readable(&conn, &mut core.messages.borrow_mut(), &mut parser, &buf[..n], |m| {
            completed.push(m)
        });

        if let Err(e) = result {
            if e.is_alloc_fail() {
                continue;
            }
            warn!(server_id = conn.borrow().id, error = %e, "closing backend connection on parse error");
            sender::drain_with_error(&conn, &mut core.messages.borrow_mut());
            break;
        }

        let now = tokio::time::Instant::now();
        for rmsg in completed {
            filter::filter_and_forward(
                &conn,
                rmsg,
                &mut core.messages.borrow_mut(),
                &core.slowlog,
                &mut core.addr_cache.borrow_mut(),
                now,
            );
        }
    }

    core.connections.borrow_mut().release(&conn);
}

/// Reads whatever bytes a client sends, treats each read as one
/// complete request verbatim (request parsing is out of scope), and
/// forwards it to the backend while enqueuing bookkeeping on both
/// out-queues so the response core can match the eventual reply. Also
/// drains the client's out-queue as replies become ready to send.
async fn handle_client(core: Rc<Core>, socket: TcpStream, peer_addr: SocketAddr, backend: Backend, protocol: Protocol) {
    let client_conn = core.connections.borrow_mut().acquire(Role::Client, protocol, peer_addr);
    let (mut read_half, mut write_half) = socket.into_split();
    let write_notify = client_conn.borrow().write_notify();

    let writer_conn = client_conn.clone();
    let writer_core = core.clone();
    let writer_pool = backend.record.borrow().pool.clone();
    let writer = tokio::task::spawn_local(async move {
        loop {
            write_notify.notified().await;
            loop {
                let outcome = sender::next_to_send(
                    &writer_conn,
                    &mut writer_core.messages.borrow_mut(),
                    protocol,
                    Some(&writer_pool),
                );
                let msg = match outcome {
                    sender::SendOutcome::Nothing => break,
                    sender::SendOutcome::Message(m) => m,
                };
                let bytes = msg.borrow().buf.to_vec();
                if let Err(e) = write_half.write_all(&bytes).await {
                    warn!(client_id = writer_conn.borrow().id, error = %e, "client write error");
                    writer_conn.borrow_mut().done = true;
                    return;
                }
                sender::send_done(&writer_conn, &mut writer_core.messages.borrow_mut(), &msg);
            }
            if writer_conn.borrow().done {
                return;
            }
        }
    });

    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(client_id = client_conn.borrow().id, error = %e, "client read error");
                break;
            }
        };

        let req = {
            let mut pool = core.messages.borrow_mut();
            match pool.new_request(&client_conn) {
                Ok(m) => m,
                Err(_) => continue, // alloc_fail: drop this request, non-fatal
            }
        };
        {
            let mut m = req.borrow_mut();
            m.buf.extend_from_slice(&buf[..n]);
            m.mlen = n;
            m.slowlog_stime = Some(tokio::time::Instant::now());
        }
        Connection::enqueue_outq(&client_conn, &req);
        Connection::enqueue_outq(&backend.conn, &req);

        let bytes = req.borrow().buf.to_vec();
        if backend.request_tx.send(bytes).is_err() {
            warn!(client_id = client_conn.borrow().id, "backend writer gone, closing client");
            break;
        }
    }

    client_conn.borrow_mut().eof = true;
    writer.abort();
    core.connections.borrow_mut().release(&client_conn);
}
