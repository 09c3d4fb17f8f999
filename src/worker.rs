//! Routing Workers
//!
//! A worker is a single-owner scheduling domain: every DCB registered with
//! it is mutated only from the worker's task, and everything another thread
//! wants done to one of its DCBs arrives as a command on the worker's queue.
//! Socket readiness is polled per DCB with a generation tag, so wakeups that
//! raced a close or an interest change are dropped instead of dispatched.
//!
//! Dispatch order within one readiness turn is fixed: error, writable,
//! readable, hangup. Injected events queued while handling a turn are
//! drained to completion before the DCB is re-armed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::future::BoxFuture;
use tokio::io::{Interest, Ready};
use tokio::sync::{mpsc, oneshot};

use crate::buffer::Buffer;
use crate::dcb::{event, Dcb, DcbHandler, SslState};

/// Commands a worker executes on its own thread of control
pub enum WorkerCommand {
    /// Adopt a DCB and its protocol handler
    Register {
        dcb: Dcb,
        handler: Box<dyn DcbHandler>,
    },
    /// Injected event for a DCB, filtered by uid at delivery
    FakeEvent { uid: u64, mask: u32 },
    /// Pause or resume reads on a DCB
    SetReadsEnabled { uid: u64, enabled: bool },
    /// Append bytes to a DCB's write queue
    Write { uid: u64, data: Vec<u8> },
    /// Close a DCB
    Close { uid: u64 },
    /// Run a closure on the worker
    Task(Box<dyn FnOnce() + Send>),
    /// Close every DCB and stop the worker
    Shutdown,
}

/// Cloneable handle to a worker's command queue
#[derive(Clone)]
pub struct WorkerHandle {
    id: usize,
    tx: mpsc::UnboundedSender<WorkerCommand>,
    load: Arc<AtomicUsize>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of DCBs currently registered
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Relaxed)
    }

    /// Post a command; false when the worker is gone
    pub fn post(&self, command: WorkerCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Post a closure to run on the worker
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post(WorkerCommand::Task(Box::new(task)))
    }

    /// Hand a DCB to this worker and get back a remote for it
    pub fn register_dcb(&self, dcb: Dcb, handler: Box<dyn DcbHandler>) -> DcbRemote {
        let uid = dcb.uid();
        self.post(WorkerCommand::Register { dcb, handler });
        DcbRemote {
            uid,
            worker: self.clone(),
        }
    }
}

/// Cross-thread reference to a DCB: a uid plus its owning worker.
///
/// Every operation is posted to the owner; nothing here touches the DCB
/// directly. Operations on a DCB that has since closed are dropped by the
/// uid check on the worker.
#[derive(Clone)]
pub struct DcbRemote {
    uid: u64,
    worker: WorkerHandle,
}

impl DcbRemote {
    /// Remote for a DCB that is about to be registered on `worker`.
    /// Commands sent before registration completes are dropped by the
    /// uid check, exactly like commands after close.
    pub fn for_registration(uid: u64, worker: WorkerHandle) -> Self {
        Self { uid, worker }
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    pub fn trigger_read_event(&self) {
        self.worker.post(WorkerCommand::FakeEvent {
            uid: self.uid,
            mask: event::READ,
        });
    }

    pub fn trigger_write_event(&self) {
        self.worker.post(WorkerCommand::FakeEvent {
            uid: self.uid,
            mask: event::WRITE,
        });
    }

    pub fn trigger_hangup_event(&self) {
        self.worker.post(WorkerCommand::FakeEvent {
            uid: self.uid,
            mask: event::HANGUP,
        });
    }

    pub fn set_reads_enabled(&self, enabled: bool) {
        self.worker.post(WorkerCommand::SetReadsEnabled {
            uid: self.uid,
            enabled,
        });
    }

    pub fn write(&self, data: Vec<u8>) {
        self.worker.post(WorkerCommand::Write {
            uid: self.uid,
            data,
        });
    }

    pub fn close(&self) {
        self.worker.post(WorkerCommand::Close { uid: self.uid });
    }
}

/// The fixed pool: `n` routing workers plus one main worker
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    main: WorkerHandle,
}

impl WorkerPool {
    /// Spawn the main worker and `routing_workers` routing workers
    pub fn start(routing_workers: usize) -> Self {
        let main = spawn_worker(0);
        let workers = (1..=routing_workers.max(1)).map(spawn_worker).collect();
        Self { workers, main }
    }

    /// The main worker, used for cross-worker coordination
    pub fn main(&self) -> &WorkerHandle {
        &self.main
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// Pick the routing worker with the fewest registered DCBs
    pub fn least_loaded(&self) -> WorkerHandle {
        self.workers
            .iter()
            .min_by_key(|w| w.load())
            .expect("pool has workers")
            .clone()
    }

    /// Stop every worker, closing all DCBs
    pub fn shutdown(&self) {
        for worker in &self.workers {
            worker.post(WorkerCommand::Shutdown);
        }
        self.main.post(WorkerCommand::Shutdown);
    }
}

fn spawn_worker(id: usize) -> WorkerHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let load = Arc::new(AtomicUsize::new(0));
    let inner = WorkerInner {
        id,
        dcbs: HashMap::new(),
        ready: FuturesUnordered::new(),
        load: load.clone(),
    };
    tokio::spawn(run_worker(inner, rx));
    WorkerHandle { id, tx, load }
}

/// Outcome of one readiness poll
struct ReadyMsg {
    uid: u64,
    generation: u64,
    result: Option<std::io::Result<Ready>>,
}

struct DcbEntry {
    dcb: Dcb,
    handler: Box<dyn DcbHandler>,
    /// Bumped whenever interest changes; stale polls are discarded
    generation: u64,
    /// Cancels the outstanding readiness poll
    abort: Option<oneshot::Sender<()>>,
}

struct WorkerInner {
    id: usize,
    dcbs: HashMap<u64, DcbEntry>,
    ready: FuturesUnordered<BoxFuture<'static, ReadyMsg>>,
    load: Arc<AtomicUsize>,
}

async fn run_worker(mut inner: WorkerInner, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
    tracing::debug!(worker = inner.id, "worker started");
    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(WorkerCommand::Shutdown) | None => break,
                    Some(command) => inner.handle_command(command),
                }
            }
            Some(msg) = inner.ready.next(), if !inner.ready.is_empty() => {
                inner.handle_ready(msg);
            }
        }
    }

    // Drain: close every remaining DCB in an orderly fashion.
    let uids: Vec<u64> = inner.dcbs.keys().copied().collect();
    for uid in uids {
        if let Some(mut entry) = inner.dcbs.remove(&uid) {
            entry.dcb.close();
            entry.handler.finish_connection(&mut entry.dcb);
            entry.dcb.destroy();
        }
    }
    inner.load.store(0, Ordering::Relaxed);
    tracing::debug!(worker = inner.id, "worker stopped");
}

impl WorkerInner {
    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Register { mut dcb, handler } => {
                let uid = dcb.uid();
                dcb.set_owner(self.id);
                if let Err(e) = dcb.enable_events() {
                    tracing::error!(worker = self.id, uid, error = %e, "failed to poll DCB");
                    return;
                }
                self.load.fetch_add(1, Ordering::Relaxed);
                let mut entry = DcbEntry {
                    dcb,
                    handler,
                    generation: 0,
                    abort: None,
                };
                self.arm(uid, &mut entry);
                self.dcbs.insert(uid, entry);
                tracing::debug!(worker = self.id, uid, "DCB registered");
            }
            WorkerCommand::FakeEvent { uid, mask } => {
                self.with_entry(uid, |entry| {
                    if mask & event::READ != 0 {
                        entry.dcb.trigger_read_event();
                    }
                    if mask & event::WRITE != 0 {
                        entry.dcb.trigger_write_event();
                    }
                    if mask & event::HANGUP != 0 {
                        entry.dcb.trigger_hangup_event();
                    }
                    if mask & event::ERROR != 0 {
                        entry.dcb.triggered_event |= event::ERROR;
                    }
                });
            }
            WorkerCommand::SetReadsEnabled { uid, enabled } => {
                self.with_entry(uid, |entry| entry.dcb.set_reads_enabled(enabled));
            }
            WorkerCommand::Write { uid, data } => {
                self.with_entry(uid, |entry| {
                    entry.dcb.writeq_append(Buffer::from_vec(data));
                });
            }
            WorkerCommand::Close { uid } => {
                self.with_entry(uid, |entry| entry.dcb.close());
            }
            WorkerCommand::Task(task) => task(),
            WorkerCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    /// Run `f` against a registered DCB, then drain injected events and
    /// re-arm. Unknown uids (already closed, stale remote) are ignored.
    fn with_entry(&mut self, uid: u64, f: impl FnOnce(&mut DcbEntry)) {
        let Some(mut entry) = self.dcbs.remove(&uid) else {
            tracing::trace!(worker = self.id, uid, "command for unknown DCB dropped");
            return;
        };
        f(&mut entry);
        self.finish_turn(uid, entry);
    }

    fn handle_ready(&mut self, msg: ReadyMsg) {
        let Some(mut entry) = self.dcbs.remove(&msg.uid) else {
            return;
        };
        if msg.generation != entry.generation {
            // Interest changed while this poll was in flight.
            self.finish_turn(msg.uid, entry);
            return;
        }
        entry.abort = None;

        match msg.result {
            None => {} // aborted poll
            Some(Err(e)) => {
                tracing::error!(worker = self.id, uid = msg.uid, error = %e, "poll error");
                Self::invoke(&mut entry, |h, d| h.error(d));
            }
            Some(Ok(ready)) => self.dispatch(&mut entry, ready),
        }

        self.finish_turn(msg.uid, entry);
    }

    /// Deliver one readiness turn in the fixed priority order, rechecking
    /// openness after every handler call.
    fn dispatch(&mut self, entry: &mut DcbEntry, ready: Ready) {
        if ready.is_error() && entry.dcb.is_open() {
            Self::invoke(entry, |h, d| h.error(d));
        }
        if ready.is_writable() && entry.dcb.is_open() {
            entry.dcb.clear_tls_read_intent();
            Self::invoke(entry, |h, d| h.write_ready(d));
        }
        if ready.is_readable() && entry.dcb.is_open() {
            let proceed = match entry.dcb.ssl_state() {
                SslState::None | SslState::Established => true,
                SslState::HandshakeRequired => match entry.dcb.ssl_handshake() {
                    Ok(done) => done,
                    Err(e) => {
                        tracing::error!(uid = entry.dcb.uid(), error = %e, "TLS handshake failed");
                        entry.dcb.close();
                        false
                    }
                },
                SslState::HandshakeFailed => {
                    entry.dcb.close();
                    false
                }
            };
            if proceed && entry.dcb.is_open() {
                Self::invoke(entry, |h, d| h.ready_for_reading(d));
            }
        }
        if (ready.is_read_closed() || ready.is_write_closed()) && entry.dcb.is_open() {
            Self::invoke(entry, |h, d| h.hangup(d));
        }
    }

    fn invoke(
        entry: &mut DcbEntry,
        f: impl FnOnce(&mut Box<dyn DcbHandler>, &mut Dcb) -> crate::Result<()>,
    ) {
        if let Err(e) = f(&mut entry.handler, &mut entry.dcb) {
            tracing::error!(uid = entry.dcb.uid(), error = %e, "handler error, closing DCB");
            entry.dcb.close();
        }
    }

    /// Drain injected events, then destroy or re-arm the DCB
    fn finish_turn(&mut self, uid: u64, mut entry: DcbEntry) {
        while entry.dcb.is_open() {
            let pending = std::mem::take(&mut entry.dcb.triggered_event);
            if pending == 0 {
                break;
            }
            if pending & event::ERROR != 0 && entry.dcb.is_open() {
                Self::invoke(&mut entry, |h, d| h.error(d));
            }
            if pending & event::WRITE != 0 && entry.dcb.is_open() {
                Self::invoke(&mut entry, |h, d| h.write_ready(d));
            }
            if pending & event::READ != 0 && entry.dcb.is_open() {
                Self::invoke(&mut entry, |h, d| h.ready_for_reading(d));
            }
            if pending & event::HANGUP != 0 && entry.dcb.is_open() {
                Self::invoke(&mut entry, |h, d| h.hangup(d));
            }
        }

        if !entry.dcb.is_open() {
            entry.handler.finish_connection(&mut entry.dcb);
            entry.dcb.destroy();
            self.load.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(worker = self.id, uid, "DCB destroyed");
            return;
        }

        self.arm(uid, &mut entry);
        self.dcbs.insert(uid, entry);
    }

    /// Queue a readiness poll matching the DCB's current interest
    fn arm(&mut self, uid: u64, entry: &mut DcbEntry) {
        // Cancel whatever poll is still in flight; its generation is stale.
        if let Some(abort) = entry.abort.take() {
            let _ = abort.send(());
        }
        entry.generation += 1;

        let wants_read = entry.dcb.wants_read_interest();
        let wants_write = entry.dcb.wants_write_interest();
        let interest = match (wants_read, wants_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => return,
        };
        let Some(stream) = entry.dcb.stream() else {
            return;
        };

        let (abort_tx, abort_rx) = oneshot::channel();
        entry.abort = Some(abort_tx);
        let generation = entry.generation;

        self.ready.push(Box::pin(async move {
            tokio::select! {
                result = stream.ready(interest) => ReadyMsg {
                    uid,
                    generation,
                    result: Some(result),
                },
                _ = abort_rx => ReadyMsg {
                    uid,
                    generation,
                    result: None,
                },
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dcb::{DcbLimits, DcbRole};
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    struct EchoHandler {
        seen: Arc<Mutex<Vec<u8>>>,
    }

    impl DcbHandler for EchoHandler {
        fn ready_for_reading(&mut self, dcb: &mut Dcb) -> crate::Result<()> {
            if let Some(buf) = dcb.read(0, 0)? {
                let data = buf.to_vec();
                self.seen.lock().unwrap().extend_from_slice(&data);
                dcb.writeq_append(Buffer::from_vec(data));
            }
            Ok(())
        }
    }

    struct CountingHandler {
        reads: Arc<AtomicU64>,
    }

    impl DcbHandler for CountingHandler {
        fn ready_for_reading(&mut self, dcb: &mut Dcb) -> crate::Result<()> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let _ = dcb.read(0, 0)?;
            Ok(())
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_echo_through_worker() {
        let pool = WorkerPool::start(1);
        let (ours, mut theirs) = socket_pair().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let dcb = Dcb::new(DcbRole::Client, ours, DcbLimits::default());
        let worker = pool.least_loaded();
        let _remote = worker.register_dcb(dcb, Box::new(EchoHandler { seen: seen.clone() }));

        theirs.write_all(b"hello").await.unwrap();

        let mut reply = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(2), async {
            use tokio::io::AsyncReadExt;
            theirs.read_exact(&mut reply).await.unwrap();
        })
        .await
        .unwrap();
        assert_eq!(&reply, b"hello");
        assert_eq!(seen.lock().unwrap().as_slice(), b"hello");
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_fake_read_event_delivered() {
        let pool = WorkerPool::start(1);
        let (ours, _theirs) = socket_pair().await;

        let reads = Arc::new(AtomicU64::new(0));
        let dcb = Dcb::new(DcbRole::Client, ours, DcbLimits::default());
        let worker = pool.least_loaded();
        let remote = worker.register_dcb(dcb, Box::new(CountingHandler { reads: reads.clone() }));

        remote.trigger_read_event();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_stale_uid_event_dropped() {
        let pool = WorkerPool::start(1);
        let (ours, _theirs) = socket_pair().await;

        let reads = Arc::new(AtomicU64::new(0));
        let dcb = Dcb::new(DcbRole::Client, ours, DcbLimits::default());
        let worker = pool.least_loaded();
        let remote = worker.register_dcb(dcb, Box::new(CountingHandler { reads: reads.clone() }));

        remote.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The DCB is gone; this event must be dropped, not crash or
        // reach a different DCB.
        remote.trigger_read_event();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_reads_disabled_defers_fake_event() {
        let pool = WorkerPool::start(1);
        let (ours, _theirs) = socket_pair().await;

        let reads = Arc::new(AtomicU64::new(0));
        let dcb = Dcb::new(DcbRole::Client, ours, DcbLimits::default());
        let worker = pool.least_loaded();
        let remote = worker.register_dcb(dcb, Box::new(CountingHandler { reads: reads.clone() }));

        remote.set_reads_enabled(false);
        remote.trigger_read_event();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        // Re-enabling replays the saved trigger.
        remote.set_reads_enabled(true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_cross_dcb_write_command() {
        let pool = WorkerPool::start(2);
        let (ours, mut theirs) = socket_pair().await;

        let dcb = Dcb::new(DcbRole::Backend, ours, DcbLimits::default());
        let worker = pool.least_loaded();
        let remote = worker.register_dcb(
            dcb,
            Box::new(CountingHandler {
                reads: Arc::new(AtomicU64::new(0)),
            }),
        );

        // Write from outside the owning worker.
        remote.write(b"posted".to_vec());

        let mut reply = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(2), async {
            use tokio::io::AsyncReadExt;
            theirs.read_exact(&mut reply).await.unwrap();
        })
        .await
        .unwrap();
        assert_eq!(&reply, b"posted");
        pool.shutdown();
    }
}
