//! MySQL Client Listener
//!
//! Accepts client connections, answers the handshake, opens a backend
//! endpoint on the same worker and forwards queries transparently. The
//! downstream throttle is installed here: a client that stops reading its
//! results pauses reads from every backend of its session instead of
//! queueing replies without bound.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::buffer::Buffer;
use crate::config::ListenerConfig;
use crate::dcb::{CallbackReason, Dcb, DcbHandler, DcbLimits, DcbRole};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::proxy::protocol::{
    self, build_error_packet, build_ok_packet, error_code, MySqlPacket, PacketType,
};
use crate::server::{Server, ServerSet};
use crate::session::{Session, SessionAuth};
use crate::worker::{DcbRemote, WorkerPool};

/// Client connection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientPhase {
    /// Handshake sent, waiting for the response
    Authenticating,
    /// Normal command traffic
    Ready,
}

/// Protocol handler for an accepted client connection
pub struct ClientHandler {
    session: Arc<Session>,
    backend: DcbRemote,
    phase: ClientPhase,
    pending: Vec<u8>,
}

impl ClientHandler {
    pub fn new(session: Arc<Session>, backend: DcbRemote) -> Self {
        Self {
            session,
            backend,
            phase: ClientPhase::Authenticating,
            pending: Vec::new(),
        }
    }

    fn handle_packet(&mut self, dcb: &mut Dcb, packet: MySqlPacket) -> Result<()> {
        if self.phase == ClientPhase::Authenticating {
            // Authentication providers are external collaborators; the
            // listener records the announced user and accepts.
            let user = parse_handshake_user(&packet.payload).unwrap_or_default();
            self.session.set_auth(SessionAuth {
                user: user.clone(),
                default_db: None,
            });
            tracing::debug!(session = %self.session.id(), user, "client authenticated");
            let ok = build_ok_packet(packet.header.sequence_id.wrapping_add(1), 0, 0);
            dcb.writeq_append(Buffer::from_vec(ok.to_bytes()));
            self.phase = ClientPhase::Ready;
            return Ok(());
        }

        match packet.command() {
            Some(PacketType::Quit) => {
                tracing::debug!(session = %self.session.id(), "client sent QUIT");
                dcb.close();
            }
            Some(PacketType::Ping) => {
                let ok = build_ok_packet(packet.header.sequence_id.wrapping_add(1), 0, 0);
                dcb.writeq_append(Buffer::from_vec(ok.to_bytes()));
            }
            Some(PacketType::Query) | Some(PacketType::Unknown(_)) => {
                if self.session.is_stopping() {
                    let err = build_error_packet(
                        packet.header.sequence_id.wrapping_add(1),
                        error_code::UNKNOWN,
                        "HY000",
                        "Session is closing",
                    );
                    dcb.writeq_append(Buffer::from_vec(err.to_bytes()));
                    return Ok(());
                }
                // Transparent forward; the backend handler relays replies.
                self.backend.write(packet.to_bytes());
            }
            _ => {}
        }
        Ok(())
    }
}

impl DcbHandler for ClientHandler {
    fn ready_for_reading(&mut self, dcb: &mut Dcb) -> Result<()> {
        let Some(buf) = dcb.read(0, 0)? else {
            return Ok(());
        };
        self.pending.extend_from_slice(&buf.to_vec());

        while let Ok((packet, consumed)) = MySqlPacket::read(&self.pending) {
            self.pending.drain(..consumed);
            self.handle_packet(dcb, packet)?;
            if !dcb.is_open() {
                break;
            }
        }
        Ok(())
    }

    fn hangup(&mut self, dcb: &mut Dcb) -> Result<()> {
        dcb.close();
        Ok(())
    }

    fn finish_connection(&mut self, _dcb: &mut Dcb) {
        // Client gone: tear the whole session down, backends first.
        self.session.stop();
    }
}

/// Load the listener's TLS context from PEM cert and key files
pub fn load_server_tls(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<Arc<rustls::ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<std::io::Result<Vec<_>>>()?;

    let key_file = std::fs::File::open(key_path)?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))?
        .ok_or_else(|| Error::Tls(format!("no private key in {}", key_path.display())))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Load a client-side TLS context trusting the given CA bundle, used for
/// TLS towards backend servers.
pub fn load_client_tls(ca_path: &std::path::Path) -> Result<Arc<rustls::ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    let ca_file = std::fs::File::open(ca_path)?;
    for cert in rustls_pemfile::certs(&mut std::io::BufReader::new(ca_file)) {
        roots
            .add(cert?)
            .map_err(|e| Error::Tls(format!("bad CA certificate: {}", e)))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Pick the server new sessions should land on: the master if one is
/// usable, otherwise any usable server.
pub fn select_backend(servers: &ServerSet) -> Option<Arc<Server>> {
    servers
        .all()
        .iter()
        .find(|s| s.is_master() && s.is_usable())
        .or_else(|| servers.all().iter().find(|s| s.is_usable()))
        .cloned()
}

/// Client accept loop
pub async fn run_listener(
    config: ListenerConfig,
    servers: Arc<ServerSet>,
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "MySQL listener ready");

    let limits = DcbLimits {
        high_water: config.high_water,
        low_water: config.low_water,
        max_read_amount: config.max_read_amount,
    };

    let tls_config = match (&config.ssl_enabled, &config.ssl_cert, &config.ssl_key) {
        (true, Some(cert), Some(key)) => Some(load_server_tls(cert, key)?),
        (true, _, _) => {
            return Err(Error::Config(
                "listener.ssl_enabled requires ssl_cert and ssl_key".into(),
            ));
        }
        _ => None,
    };

    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => break,
        };
        tracing::info!(peer = %addr, "client connection accepted");

        let Some(server) = select_backend(&servers) else {
            tracing::warn!(peer = %addr, "no usable backend, rejecting client");
            continue;
        };

        let worker = pool.least_loaded();
        let mut client_dcb = Dcb::new(DcbRole::Client, socket, limits.clone());
        if let Some(tls) = &tls_config {
            match rustls::ServerConnection::new(tls.clone()) {
                Ok(conn) => client_dcb.enable_tls(conn.into()),
                Err(e) => {
                    tracing::error!(error = %e, "TLS session setup failed");
                    continue;
                }
            }
        }
        let client_remote = DcbRemote::for_registration(client_dcb.uid(), worker.clone());

        // Backend first, so the client handler has somewhere to route.
        let mut endpoint = Endpoint::new(server.clone());
        let backend = match endpoint
            .connect(
                &worker,
                client_remote.clone(),
                &config.backend_user,
                &config.backend_password,
                limits.clone(),
                Duration::from_secs(10),
            )
            .await
        {
            Ok(remote) => remote,
            Err(e) => {
                tracing::error!(server = server.name(), error = %e, "backend connect failed");
                continue;
            }
        };

        let session = Session::new(worker.id(), client_remote);
        session.add_backend(endpoint);

        // Downstream throttle: a full client queue pauses every backend
        // of this session.
        let throttle_session = session.clone();
        client_dcb.add_callback(
            CallbackReason::HighWater,
            Box::new(move |_| {
                for backend in throttle_session.backend_remotes() {
                    backend.set_reads_enabled(false);
                }
            }),
        );
        let resume_session = session.clone();
        client_dcb.add_callback(
            CallbackReason::LowWater,
            Box::new(move |_| {
                for backend in resume_session.backend_remotes() {
                    backend.set_reads_enabled(true);
                }
            }),
        );

        // Greet the client before handing the DCB to its worker.
        let mut scramble = [0u8; 20];
        rand::thread_rng().fill(&mut scramble);
        let handshake = protocol::build_handshake_packet("10.5.0-wolfrelay", &scramble);
        client_dcb.writeq_append(Buffer::from_vec(handshake.to_bytes()));

        let handler = ClientHandler::new(session, backend);
        worker.register_dcb(client_dcb, Box::new(handler));
    }
    Ok(())
}

/// Extract the user name from a handshake response packet
fn parse_handshake_user(payload: &[u8]) -> Option<String> {
    // capabilities(4) max_packet(4) charset(1) reserved(23), then the
    // NUL-terminated user name.
    if payload.len() < 33 {
        return None;
    }
    let rest = &payload[32..];
    let end = rest.iter().position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&rest[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::server::status;

    fn make_server_set(specs: &[(&str, u64)]) -> ServerSet {
        let configs: Vec<ServerConfig> = specs
            .iter()
            .map(|(name, _)| ServerConfig {
                name: name.to_string(),
                address: "127.0.0.1".into(),
                socket: None,
                port: 3306,
                monitor_user: None,
                monitor_password: None,
                ssl_enabled: false,
                ssl_ca: None,
                disk_space_threshold: None,
            })
            .collect();
        let set = ServerSet::from_config(&configs);
        for (name, bits) in specs {
            set.get(name).unwrap().assign_status(*bits);
        }
        set
    }

    #[test]
    fn test_select_backend_prefers_master() {
        let set = make_server_set(&[
            ("slave1", status::RUNNING | status::SLAVE),
            ("master1", status::RUNNING | status::MASTER),
        ]);
        assert_eq!(select_backend(&set).unwrap().name(), "master1");
    }

    #[test]
    fn test_select_backend_skips_maintenance() {
        let set = make_server_set(&[
            ("master1", status::RUNNING | status::MASTER | status::MAINT),
            ("slave1", status::RUNNING | status::SLAVE),
        ]);
        assert_eq!(select_backend(&set).unwrap().name(), "slave1");
    }

    #[test]
    fn test_select_backend_none_when_all_down() {
        let set = make_server_set(&[("db1", 0), ("db2", status::MAINT)]);
        assert!(select_backend(&set).is_none());
    }

    #[test]
    fn test_parse_handshake_user() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(b"appuser\0more");
        assert_eq!(parse_handshake_user(&payload).unwrap(), "appuser");
        assert!(parse_handshake_user(&[0u8; 10]).is_none());
    }
}
