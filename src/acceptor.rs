//! TCP front end: accept loop, per-client reader threads, and the periodic
//! session-maintenance thread.
//!
//! Each connection gets its own session and reader thread; writes go
//! through a shared writer map the gateway's send function uses. The
//! maintenance thread drives heartbeat timers once a second and reaps
//! sessions that timed out or logged out. Everything below the gateway
//! treats the connection as a byte-duplex pipe keyed by client id.

use crate::fix::codec::Codec;
use crate::fix::session::{FixSession, SessionConfig};
use crate::gateway::Gateway;
use log::{info, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often reader threads wake up to check for a dead session, and how
/// often the maintenance thread ticks.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

type WriterMap = Arc<Mutex<HashMap<String, TcpStream>>>;

/// Runs the accept loop until `running` clears. Installs the gateway send
/// function, spawns one reader thread per connection plus one maintenance
/// thread. Blocks the calling thread.
pub fn run_acceptor(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    codec: Codec,
    comp_id: String,
    heartbeat_interval: Duration,
    running: Arc<AtomicBool>,
) {
    let writers: WriterMap = Arc::new(Mutex::new(HashMap::new()));
    install_send_fn(&gateway, writers.clone());
    spawn_maintenance(gateway.clone(), writers.clone(), running.clone());

    info!(
        "accepting connections on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    );
    let mut connection_seq = 0u64;
    for stream in listener.incoming() {
        if !running.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("accept failed: {}", e);
                continue;
            }
        };
        connection_seq += 1;
        let client_id = match stream.peer_addr() {
            Ok(addr) => format!("{}#{}", addr, connection_seq),
            Err(_) => format!("conn#{}", connection_seq),
        };
        info!("client connected: {}", client_id);

        let writer = match stream.try_clone() {
            Ok(w) => w,
            Err(e) => {
                warn!("cannot clone stream for {}: {}", client_id, e);
                continue;
            }
        };
        writers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.clone(), writer);

        let session = Arc::new(Mutex::new(FixSession::new(
            SessionConfig::acceptor(comp_id.clone()).with_heartbeat_interval(heartbeat_interval),
            codec.clone(),
        )));
        gateway.register_session(&client_id, session.clone());

        let gateway = gateway.clone();
        let writers = writers.clone();
        let thread_name = format!("reader-{}", connection_seq);
        let _ = std::thread::Builder::new().name(thread_name).spawn(move || {
            handle_client(stream, client_id, session, gateway, writers);
        });
    }
    info!("accept loop stopped");
}

fn install_send_fn(gateway: &Gateway, writers: WriterMap) {
    gateway.set_send_fn(Box::new(move |client_id, bytes| {
        let mut map = writers.lock().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(client_id) {
            Some(stream) => stream.write_all(bytes).is_ok(),
            None => false,
        }
    }));
}

/// Reads bytes, feeds the session, forwards surviving application messages
/// to the gateway, and writes back whatever the session queued.
fn handle_client(
    mut stream: TcpStream,
    client_id: String,
    session: Arc<Mutex<FixSession>>,
    gateway: Arc<Gateway>,
    writers: WriterMap,
) {
    if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL)) {
        warn!("{}: cannot set read timeout: {}", client_id, e);
    }
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("{}: peer closed connection", client_id);
                break;
            }
            Ok(n) => {
                let result = session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .on_bytes(&buf[..n]);
                match result {
                    Ok(applications) => {
                        gateway.flush_session(&client_id);
                        for app in applications {
                            gateway.on_application_message(&client_id, &app);
                        }
                    }
                    Err(e) => {
                        warn!("{}: session failure: {}", client_id, e);
                        gateway.flush_session(&client_id);
                        break;
                    }
                }
                if session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .should_disconnect()
                {
                    gateway.flush_session(&client_id);
                    break;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                // Poll tick: the maintenance thread may have expired us.
                if session
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .should_disconnect()
                {
                    break;
                }
            }
            Err(e) => {
                warn!("{}: read failed: {}", client_id, e);
                break;
            }
        }
    }
    disconnect(&client_id, &gateway, &writers);
}

/// Once a second: drive session timers, flush any heartbeats they queued,
/// and cut connections whose sessions expired or logged out.
fn spawn_maintenance(gateway: Arc<Gateway>, writers: WriterMap, running: Arc<AtomicBool>) {
    let _ = std::thread::Builder::new()
        .name("session-maintenance".to_string())
        .spawn(move || {
            while running.load(Ordering::Acquire) {
                std::thread::sleep(MAINTENANCE_INTERVAL);
                for client_id in gateway.session_ids() {
                    let Some(session) = gateway.session(&client_id) else {
                        continue;
                    };
                    let result = session
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .check_timers(Instant::now());
                    gateway.flush_session(&client_id);
                    let dead = result.is_err()
                        || session
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .should_disconnect();
                    if dead {
                        if let Err(e) = result {
                            warn!("{}: {}", client_id, e);
                        }
                        disconnect(&client_id, &gateway, &writers);
                    }
                }
            }
        });
}

/// Idempotent teardown: unregister the session and shut the socket down.
fn disconnect(client_id: &str, gateway: &Gateway, writers: &WriterMap) {
    gateway.unregister_session(client_id);
    if let Some(stream) = writers
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(client_id)
    {
        let _ = stream.shutdown(Shutdown::Both);
        info!("client disconnected: {}", client_id);
    }
}
