//! Identifier-multiplex proxy
//!
//! Lets several syncs share one listening port on the target host. Each
//! inbound connection starts with a fixed-length identifier; the proxy
//! resolves it to a target file through the environment, launches a backend
//! sync server bound to that file on a per-worker port, and bridges bytes in
//! both directions until either side closes. Each worker serves exactly one
//! identifier per program run, and a second dialer for an identifier some
//! worker already claimed is dropped.

use std::collections::HashMap;
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;
use std::thread;

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::error::SyncError;
use crate::protocol::{retry, BACKEND_BASE_PORT, IDENTIFIER_LENGTH};

pub struct ProxyServer {
    listen_port: u16,
    blocksync_path: PathBuf,
    block_size: u64,
    identifiers: Vec<String>,
}

impl ProxyServer {
    pub fn new(
        blocksync_path: impl Into<PathBuf>,
        block_size: u64,
        listen_port: u16,
        identifiers: Vec<String>,
    ) -> Self {
        ProxyServer {
            listen_port,
            blocksync_path: blocksync_path.into(),
            block_size,
            identifiers,
        }
    }

    /// Accept one session per declared identifier, bridging each to its own
    /// backend sync server. Returns once every worker has finished.
    pub fn start(&self) -> Result<()> {
        for identifier in &self.identifiers {
            if identifier.len() != IDENTIFIER_LENGTH {
                bail!(SyncError::IdentifierLength {
                    expected: IDENTIFIER_LENGTH,
                    actual: identifier.len(),
                });
            }
        }
        info!("listening on port {}", self.listen_port);
        let listener = TcpListener::bind(("0.0.0.0", self.listen_port))
            .with_context(|| format!("bind port {}", self.listen_port))?;
        let processing: Mutex<HashMap<String, usize>> = Mutex::new(HashMap::new());

        thread::scope(|scope| {
            let mut workers = Vec::with_capacity(self.identifiers.len());
            for worker in 1..=self.identifiers.len() {
                let listener = match listener.try_clone() {
                    Ok(l) => l,
                    Err(e) => return Err(e).context("clone proxy listener"),
                };
                let processing = &processing;
                workers.push(
                    scope.spawn(move || self.process_connections(listener, processing, worker)),
                );
            }
            for handle in workers {
                if let Err(e) = handle.join().expect("proxy worker panicked") {
                    error!("proxy worker failed: {e:#}");
                }
            }
            Ok(())
        })
    }

    fn process_connections(
        &self,
        listener: TcpListener,
        processing: &Mutex<HashMap<String, usize>>,
        worker: usize,
    ) -> Result<()> {
        loop {
            debug!("worker {} waiting for connection", worker);
            let (mut conn, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("unable to accept connection: {e}");
                    continue;
                }
            };
            let identifier = match read_identifier(&mut conn) {
                Ok(identifier) => identifier,
                Err(e) => {
                    warn!("rejecting connection from {peer}: {e}");
                    continue;
                }
            };
            let file = match resolve_identifier(&identifier) {
                Ok(file) => file,
                Err(e) => {
                    warn!("rejecting connection from {peer}: {e}");
                    continue;
                }
            };
            {
                let mut map = processing.lock().expect("processing map poisoned");
                if let Some(claimed_by) = map.get(&identifier) {
                    info!(
                        "worker {} already processing identifier {}, dropping duplicate",
                        claimed_by, identifier
                    );
                    continue;
                }
                map.insert(identifier.clone(), worker);
            }

            let port = BACKEND_BASE_PORT + worker as u16;
            info!(
                "worker {} serving identifier {} on backend port {}",
                worker, identifier, port
            );
            match self.bridge_to_backend(conn, &file, port) {
                Ok(()) => {
                    info!("successfully completed sync proxy for {}", identifier);
                    return Ok(());
                }
                Err(e) => error!("backend sync for {} failed: {e:#}", identifier),
            }
        }
    }

    /// Launch a target-mode sync engine for `file` on `port` and pump bytes
    /// between it and the inbound connection until the sync completes.
    fn bridge_to_backend(&self, conn: TcpStream, file: &str, port: u16) -> Result<()> {
        debug!("starting backend for file {}", file);
        let mut child = Command::new(&self.blocksync_path)
            .arg(file)
            .arg("--target")
            .arg("--port")
            .arg(port.to_string())
            .arg("--block-size")
            .arg(self.block_size.to_string())
            .spawn()
            .with_context(|| format!("spawn {}", self.blocksync_path.display()))?;

        let backend = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(backend) => break backend,
                Err(e) => {
                    debug!("waiting for backend on port {}: {}", port, e);
                    thread::sleep(retry::BACKEND_INTERVAL);
                }
            }
        };
        info!("connected to backend on port {}", port);

        bridge(&conn, &backend)?;

        let status = child.wait().context("wait for backend")?;
        if !status.success() {
            bail!("backend sync server exited with {status}");
        }
        Ok(())
    }
}

pub struct ProxyClient {
    listen_port: u16,
    target_port: u16,
    target_address: String,
}

impl ProxyClient {
    pub fn new(listen_port: u16, target_port: u16, target_address: impl Into<String>) -> Self {
        ProxyClient {
            listen_port,
            target_port,
            target_address: target_address.into(),
        }
    }

    /// Accept one local sync-source connection, dial the proxy target, send
    /// the identifier, then bridge the two until the sync completes.
    pub fn connect_to_target(&self, identifier: &str) -> Result<()> {
        if identifier.len() != IDENTIFIER_LENGTH {
            bail!(SyncError::IdentifierLength {
                expected: IDENTIFIER_LENGTH,
                actual: identifier.len(),
            });
        }
        info!("listening on port {}", self.listen_port);
        let listener = TcpListener::bind(("127.0.0.1", self.listen_port))
            .with_context(|| format!("bind port {}", self.listen_port))?;
        let (inbound, _) = listener.accept()?;

        info!(
            "connecting to target {}:{}",
            self.target_address, self.target_port
        );
        let mut retries = 0;
        let mut outbound = loop {
            match TcpStream::connect((self.target_address.as_str(), self.target_port)) {
                Ok(outbound) => break outbound,
                Err(e) => {
                    warn!("unable to connect to target: {e}");
                    retries += 1;
                    if retries > retry::PROXY_ATTEMPTS {
                        bail!(SyncError::Unreachable {
                            address: format!("{}:{}", self.target_address, self.target_port),
                            retries,
                        });
                    }
                    thread::sleep(retry::PROXY_INTERVAL);
                }
            }
        };

        outbound.write_all(identifier.as_bytes())?;
        bridge(&inbound, &outbound)?;
        Ok(())
    }
}

/// Copy bytes between two connections, one thread per direction, until the
/// `local` side reaches EOF; the far write half is then shut down and the
/// reverse direction drained.
fn bridge(local: &TcpStream, remote: &TcpStream) -> Result<()> {
    let mut local_read = local.try_clone()?;
    let mut remote_write = remote.try_clone()?;
    let mut remote_read = remote.try_clone()?;
    let mut local_write = local.try_clone()?;

    let reverse = thread::spawn(move || {
        match std::io::copy(&mut remote_read, &mut local_write) {
            Ok(n) => debug!("copied {} bytes from backend", n),
            Err(e) => warn!("copy from backend ended: {e}"),
        }
        let _ = local_write.shutdown(Shutdown::Write);
    });

    let forward = std::io::copy(&mut local_read, &mut remote_write);
    let _ = remote_write.shutdown(Shutdown::Write);
    let n = forward.context("copy to backend")?;
    debug!("copied {} bytes to backend", n);

    reverse.join().expect("bridge thread panicked");
    Ok(())
}

/// Read the fixed-length session identifier that prefixes every proxied
/// connection.
fn read_identifier(conn: &mut TcpStream) -> Result<String> {
    let mut raw = [0u8; IDENTIFIER_LENGTH];
    if !crate::block_stream::fill(conn, &mut raw)? {
        bail!(SyncError::IdentifierLength {
            expected: IDENTIFIER_LENGTH,
            actual: 0,
        });
    }
    let identifier = std::str::from_utf8(&raw)
        .map_err(|_| SyncError::Protocol("identifier is not valid ascii".into()))?;
    Ok(identifier.to_string())
}

/// Map an identifier to its target file: `$<identifier>` first, then
/// `$id-<identifier>`.
fn resolve_identifier(identifier: &str) -> Result<String> {
    if let Ok(file) = std::env::var(identifier) {
        if !file.is_empty() {
            return Ok(file);
        }
    }
    if let Ok(file) = std::env::var(format!("id-{identifier}")) {
        if !file.is_empty() {
            return Ok(file);
        }
    }
    bail!(SyncError::UnknownIdentifier(identifier.to_string()))
}
