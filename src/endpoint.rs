//! Backend Endpoints
//!
//! An endpoint binds a client session to one backend server: it opens the
//! backend DCB on the session's worker, authenticates, relays queries
//! forward and replies back, and installs the upstream throttling callback
//! so a slow client pauses reads from the backend instead of buffering
//! without bound.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::buffer::Buffer;
use crate::dcb::{CallbackReason, Dcb, DcbHandler, DcbLimits, DcbRole};
use crate::error::{Error, Result};
use crate::proxy::protocol::{self, MySqlPacket};
use crate::server::Server;
use crate::worker::{DcbRemote, WorkerHandle};

/// Backend connection phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackendPhase {
    /// Waiting for the server's handshake packet
    AwaitHandshake,
    /// Auth response sent, waiting for OK
    Authenticating,
    /// Transparent relay
    Relay,
}

/// Protocol handler for a backend DCB: authenticates, then relays every
/// byte to the paired client DCB.
pub struct BackendHandler {
    server: Arc<Server>,
    client: DcbRemote,
    user: String,
    password: String,
    phase: BackendPhase,
}

impl BackendHandler {
    pub fn new(server: Arc<Server>, client: DcbRemote, user: String, password: String) -> Self {
        Self {
            server,
            client,
            user,
            password,
            phase: BackendPhase::AwaitHandshake,
        }
    }

    fn handle_handshake(&mut self, dcb: &mut Dcb, data: &[u8]) -> Result<()> {
        let (packet, _) = MySqlPacket::read(data)
            .map_err(|e| Error::Protocol(format!("bad backend handshake: {}", e)))?;

        if packet.is_err() {
            let (code, message) = packet.error().unwrap_or((0, "unknown".into()));
            return Err(Error::MySql { code, message });
        }

        // protocol version, server version (NUL terminated), thread id,
        // then the first 8 scramble bytes.
        let payload = &packet.payload;
        if payload.len() < 2 {
            return Err(Error::Protocol("short handshake payload".into()));
        }
        let version_end = payload[1..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Protocol("unterminated version string".into()))?
            + 1;
        let version = String::from_utf8_lossy(&payload[1..version_end]).into_owned();
        self.server.set_version(&version);

        let auth_start = version_end + 1 + 4;
        if payload.len() < auth_start + 8 {
            return Err(Error::Protocol("handshake too short for scramble".into()));
        }
        let mut seed = payload[auth_start..auth_start + 8].to_vec();
        // Scramble part 2 sits after the capability/charset block.
        let part2_start = auth_start + 8 + 1 + 2 + 1 + 2 + 2 + 1 + 10;
        if payload.len() >= part2_start + 12 {
            seed.extend_from_slice(&payload[part2_start..part2_start + 12]);
        }

        let scramble = protocol::scramble_password(&self.password, &seed);

        let mut response = Vec::new();
        let capabilities: u32 = 0x000f_a68d;
        response.extend_from_slice(&capabilities.to_le_bytes());
        response.extend_from_slice(&16_777_216u32.to_le_bytes());
        response.push(33); // utf8
        response.extend_from_slice(&[0u8; 23]);
        response.extend_from_slice(self.user.as_bytes());
        response.push(0);
        response.push(scramble.len() as u8);
        response.extend_from_slice(&scramble);

        let reply = MySqlPacket::new(packet.header.sequence_id.wrapping_add(1), response);
        dcb.writeq_append(Buffer::from_vec(reply.to_bytes()));
        self.phase = BackendPhase::Authenticating;
        Ok(())
    }

    fn handle_auth_reply(&mut self, data: &[u8]) -> Result<()> {
        let (packet, _) = MySqlPacket::read(data)
            .map_err(|e| Error::Protocol(format!("bad auth reply: {}", e)))?;
        if packet.is_err() {
            let (code, message) = packet.error().unwrap_or((0, "unknown".into()));
            return Err(Error::MySql { code, message });
        }
        tracing::debug!(server = self.server.name(), "backend authenticated");
        self.phase = BackendPhase::Relay;
        Ok(())
    }
}

impl DcbHandler for BackendHandler {
    fn ready_for_reading(&mut self, dcb: &mut Dcb) -> Result<()> {
        let Some(buf) = dcb.read(0, 0)? else {
            return Ok(());
        };
        let data = buf.to_vec();

        match self.phase {
            BackendPhase::AwaitHandshake => self.handle_handshake(dcb, &data),
            BackendPhase::Authenticating => self.handle_auth_reply(&data),
            BackendPhase::Relay => {
                // Response time: gap between the forwarded query hitting
                // the socket and the first reply bytes. OK replies mark
                // writes; resultsets mark reads.
                if let Some(worker_id) = dcb.owner() {
                    let elapsed = dcb.last_write().elapsed();
                    let is_read = data.get(4) != Some(&0x00);
                    self.server.record_response_time(worker_id, is_read, elapsed);
                }
                self.client.write(data);
                Ok(())
            }
        }
    }

    fn hangup(&mut self, dcb: &mut Dcb) -> Result<()> {
        tracing::info!(server = self.server.name(), "backend connection lost");
        // The client cannot continue without its backend.
        self.client.trigger_hangup_event();
        dcb.close();
        Ok(())
    }

    fn finish_connection(&mut self, _dcb: &mut Dcb) {
        self.server.connection_closed();
    }
}

/// Session-to-server binding
pub struct Endpoint {
    server: Arc<Server>,
    dcb: Option<DcbRemote>,
}

impl Endpoint {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server, dcb: None }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn remote(&self) -> Option<DcbRemote> {
        self.dcb.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.dcb.is_some()
    }

    /// Open the backend DCB on `worker` and start authentication.
    ///
    /// The upstream throttle is installed here: when this backend's write
    /// queue crosses its high watermark, reads on the paired client pause
    /// until the low watermark fires.
    pub async fn connect(
        &mut self,
        worker: &WorkerHandle,
        client: DcbRemote,
        user: &str,
        password: &str,
        limits: DcbLimits,
        connect_timeout: Duration,
    ) -> Result<DcbRemote> {
        if let Some(remote) = &self.dcb {
            return Ok(remote.clone());
        }

        let address = self.server.endpoint_address();
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.clone()))?
            .map_err(|e| Error::ConnectionFailed {
                address: address.clone(),
                reason: e.to_string(),
            })?;

        let mut dcb = Dcb::new(DcbRole::Backend, stream, limits);

        // Upstream throttle: pause the client while this queue is full.
        let throttled_client = client.clone();
        dcb.add_callback(
            CallbackReason::HighWater,
            Box::new(move |_| throttled_client.set_reads_enabled(false)),
        );
        let resumed_client = client.clone();
        dcb.add_callback(
            CallbackReason::LowWater,
            Box::new(move |_| resumed_client.set_reads_enabled(true)),
        );

        let handler = BackendHandler::new(
            self.server.clone(),
            client,
            user.to_string(),
            password.to_string(),
        );

        self.server.connection_opened();
        let remote = worker.register_dcb(dcb, Box::new(handler));
        self.dcb = Some(remote.clone());
        tracing::debug!(
            server = self.server.name(),
            address = %address,
            "backend endpoint connected"
        );
        Ok(remote)
    }

    /// Forward a client packet to the backend
    pub fn route_query(&self, packet: Vec<u8>) -> Result<()> {
        match &self.dcb {
            Some(remote) => {
                remote.write(packet);
                Ok(())
            }
            None => Err(Error::Server(format!(
                "endpoint for '{}' is not connected",
                self.server.name()
            ))),
        }
    }

    /// Release the backend DCB and the server connection slot
    pub fn close(&mut self) {
        if let Some(remote) = self.dcb.take() {
            remote.close();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("server", &self.server.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}
