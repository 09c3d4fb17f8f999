//! Client Sessions
//!
//! A session owns one client DCB and the backend endpoints opened on its
//! behalf. The session is the owner in the reference cycle between client,
//! backends and router state: closing a session walks backends first, then
//! the client DCB.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::worker::DcbRemote;

/// Per-session authentication data captured during the client handshake
#[derive(Debug, Clone, Default)]
pub struct SessionAuth {
    pub user: String,
    pub default_db: Option<String>,
}

/// One client session
pub struct Session {
    id: Uuid,
    /// Worker that owns the client DCB and all backend DCBs
    worker_id: usize,
    client: DcbRemote,
    backends: Mutex<Vec<Endpoint>>,
    auth: RwLock<SessionAuth>,
    stopping: AtomicBool,
}

impl Session {
    pub fn new(worker_id: usize, client: DcbRemote) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            worker_id,
            client,
            backends: Mutex::new(Vec::new()),
            auth: RwLock::new(SessionAuth::default()),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn client(&self) -> &DcbRemote {
        &self.client
    }

    pub fn set_auth(&self, auth: SessionAuth) {
        *self.auth.write().unwrap() = auth;
    }

    pub fn auth(&self) -> SessionAuth {
        self.auth.read().unwrap().clone()
    }

    pub fn add_backend(&self, endpoint: Endpoint) {
        self.backends.lock().unwrap().push(endpoint);
    }

    /// Remotes of every backend DCB currently attached
    pub fn backend_remotes(&self) -> Vec<DcbRemote> {
        self.backends
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| e.remote())
            .collect()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Stop the session: backends close first, then the client DCB.
    /// Idempotent; writers check `is_stopping` before queueing more data.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(session = %self.id, "stopping session");
        let mut backends = self.backends.lock().unwrap();
        for endpoint in backends.iter_mut() {
            endpoint.close();
        }
        backends.clear();
        self.client.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("stopping", &self.is_stopping())
            .finish()
    }
}
