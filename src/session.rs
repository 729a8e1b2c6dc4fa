//! C4 — IMAP Session Pool: dial/authenticate one session per server,
//! concurrently, plus the per-server folder-list cache and folder-name
//! canonicalization.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;

use anyhow::Context;
use itertools::Itertools;
use log::{info, warn};
use parking_lot::Mutex;
use rustls_connector::RustlsConnector;

use crate::config::ServerConfig;
use crate::error::EngineError;

/// Blanket marker so both the TLS and plaintext stream types can live behind
/// one trait object, letting a single `Session` type serve both transports.
pub trait ReadWrite: Read + Write + Send {}
impl<T: Read + Write + Send> ReadWrite for T {}

pub type ImapSession = imap::Session<Box<dyn ReadWrite>>;

/// Splits a `host[:port]` URI into its parts, defaulting the port to 993
/// (implicit TLS) or 143 (plaintext) depending on `use_tls`.
fn split_host_port(uri: &str, use_tls: bool) -> (String, u16) {
    match uri.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            (host.to_owned(), port.parse().unwrap_or(if use_tls { 993 } else { 143 }))
        }
        _ => (uri.to_owned(), if use_tls { 993 } else { 143 }),
    }
}

/// Dials and authenticates a single server. Fatal on any failure, per §4.4/§7
/// — the caller is expected to propagate this as a process-aborting error.
pub fn connect(server: &ServerConfig) -> anyhow::Result<ImapSession> {
    let (host, port) = split_host_port(&server.uri, server.use_tls);
    info!("connecting to {} ({}:{})", server.name, host, port);
    let stream = TcpStream::connect((host.as_str(), port))
        .with_context(|| format!("TCP connect to {} failed", server.name))?;

    let boxed: Box<dyn ReadWrite> = if server.use_tls {
        let tls = RustlsConnector::new_with_native_certs()
            .context("TLS configuration failed")?;
        let tls_stream = tls
            .connect(&host, stream)
            .with_context(|| format!("TLS handshake with {} failed", server.name))?;
        Box::new(tls_stream)
    } else {
        Box::new(stream)
    };

    let client = imap::Client::new(boxed);
    info!("logging in to {}", server.name);
    let session = client
        .login(&server.username, &server.password)
        .map_err(|(e, _)| e)
        .with_context(|| format!("login to {} failed", server.name))?;
    Ok(session)
}

/// One connected server: its session (single-writer, guarded by a mutex so
/// the pool's map can be shared across threads even though only one logical
/// worker ever contends on it at a time) and its cached folder list.
pub struct ServerSession {
    pub config: ServerConfig,
    pub session: Mutex<ImapSession>,
    pub folders: Vec<String>,
}

/// The session map, built once at startup and read-only thereafter (spec
/// §4.4/§5). Keyed by server name.
pub struct SessionPool {
    pub servers: HashMap<String, ServerSession>,
}

impl SessionPool {
    /// Dials and authenticates every configured server concurrently, one
    /// worker thread per server rendezvousing over an `mpsc` channel sized
    /// to the server count — this repo's idiomatic-Rust reading of the
    /// spec's "goroutine-equivalent worker, channel rendezvous" model for a
    /// blocking IMAP session. Any single failure is fatal: the whole
    /// process aborts rather than running with a partial fleet (§4.4).
    pub fn connect_all(servers: &[ServerConfig]) -> Result<SessionPool, EngineError> {
        let (tx, rx) = mpsc::channel();
        for server in servers.iter().cloned() {
            let tx = tx.clone();
            thread::spawn(move || {
                let result = connect(&server).and_then(|mut session| {
                    let folders = list_folders(&mut session)?;
                    Ok((session, folders))
                });
                let _ = tx.send((server, result));
            });
        }
        drop(tx);

        let mut servers_out = HashMap::new();
        for _ in 0..servers.len() {
            let (server, result) = rx.recv().expect("worker threads never drop the channel early");
            match result {
                Ok((session, folders)) => {
                    info!("{} ready, {} folders", server.name, folders.len());
                    servers_out.insert(
                        server.name.clone(),
                        ServerSession {
                            config: server,
                            session: Mutex::new(session),
                            folders,
                        },
                    );
                }
                Err(source) => {
                    // best-effort logout of whatever connected so far before aborting
                    for server_session in servers_out.values() {
                        let _ = server_session.session.lock().logout();
                    }
                    return Err(EngineError::ConnectFailure {
                        server: server.name,
                        source,
                    });
                }
            }
        }
        Ok(SessionPool {
            servers: servers_out,
        })
    }

    /// Best-effort logout of every session, regardless of earlier errors
    /// (spec §4.4).
    pub fn logout_all(&self) {
        for (name, server) in &self.servers {
            if let Err(e) = server.session.lock().logout() {
                warn!("logout of {} failed: {}", name, e);
            }
        }
    }

    /// Resolves `folder` to the server's exact-case name: first a
    /// case-insensitive match against the cached folder list, then the
    /// `inbox`/`spam` fallbacks, per §4.4.
    pub fn canonicalize_folder(&self, server_name: &str, folder: &str) -> Option<String> {
        let server = self.servers.get(server_name)?;
        canonicalize_against(&server.folders, folder)
    }
}

/// Pure folder-canonicalization logic (§4.4), factored out of
/// `SessionPool` so it can be unit tested without a live session: first
/// case-insensitive match against `folders` wins with its exact case, then
/// the `inbox`/`spam` fallbacks, else `None` for a non-empty unresolved
/// input (the caller treats that as fatal).
fn canonicalize_against(folders: &[String], folder: &str) -> Option<String> {
    if let Some(exact) = folders.iter().find(|f| f.eq_ignore_ascii_case(folder)) {
        return Some(exact.clone());
    }
    match folder.to_ascii_lowercase().as_str() {
        "inbox" => Some("INBOX".to_owned()),
        "spam" => Some("Spam".to_owned()),
        _ => None,
    }
}

/// `list("", "*")` populates the server-name → folder-list cache (§4.4).
fn list_folders(session: &mut ImapSession) -> anyhow::Result<Vec<String>> {
    let names = session.list(Some(""), Some("*")).context("LIST failed")?;
    Ok(names.iter().map(|n| n.name().to_owned()).collect_vec())
}
