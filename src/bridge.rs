//! High-level DSU Bridge
//!
//! This module wires DS3 sessions to the DSU server: sessions push reports
//! into a bounded channel, a pump thread records slot metadata and hands
//! every report to the server for broadcast.

use crate::config::{Config, ConfigError};
use crate::ds3::session::{Ds3Session, SessionConfig};
use crate::ds3::store::{JsonFileStore, KeyValueStore};
use crate::ds3::transport::HidTransport;
use crate::ds3::types::{DeviceAddress, NormalizedReport, PadId, PadMeta, PadState};
use crate::server::report::WireSettings;
use crate::server::server::{PadInfoProvider, ProtocolServer, ServerError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};

/// Capacity of the session to server report channel
const REPORT_CHANNEL_CAPACITY: usize = 100;

/// How long the pump waits for a report before re-checking the running flag
const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Bridge is already running")]
    AlreadyRunning,

    #[error("No free pad slot for {0}")]
    NoFreeSlot(DeviceAddress),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("Failed to start worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("Server thread exited during startup")]
    Startup,
}

/// The four output slots answered to list-ports requests
#[derive(Debug)]
pub struct SlotTable {
    slots: Mutex<[PadMeta; 4]>,
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(PadId::ALL.map(PadMeta::disconnected)),
        }
    }

    /// Reserve the first free slot for `address`, reusing its slot if it has one
    pub fn reserve(&self, address: DeviceAddress) -> Option<PadId> {
        let mut slots = self.slots.lock().ok()?;

        if let Some(meta) = slots
            .iter()
            .find(|m| m.state != PadState::Disconnected && m.address == address)
        {
            return Some(meta.pad_id);
        }

        let meta = slots.iter_mut().find(|m| m.state == PadState::Disconnected)?;
        meta.state = PadState::Reserved;
        meta.address = address;
        Some(meta.pad_id)
    }

    /// Record the latest metadata for the slot a report came from.
    ///
    /// Only a slot still held by the same pad is refreshed, so reports queued
    /// before a release cannot bring the slot back.
    pub fn update(&self, meta: PadMeta) {
        let Some(index) = meta.pad_id.index() else {
            return;
        };
        if let Ok(mut slots) = self.slots.lock() {
            let slot = &mut slots[index];
            if slot.state != PadState::Disconnected && slot.address == meta.address {
                *slot = meta;
            }
        }
    }

    pub fn release(&self, pad: PadId) {
        let Some(index) = pad.index() else {
            return;
        };
        if let Ok(mut slots) = self.slots.lock() {
            slots[index] = PadMeta::disconnected(pad);
        }
    }

    pub fn get(&self, pad: PadId) -> PadMeta {
        pad.index()
            .and_then(|i| self.slots.lock().ok().map(|slots| slots[i]))
            .unwrap_or_else(|| PadMeta::disconnected(pad))
    }
}

impl PadInfoProvider for SlotTable {
    fn pad_meta(&self, pad: PadId) -> PadMeta {
        self.get(pad)
    }
}

/// Bridge between DS3 sessions and the DSU server
pub struct Bridge {
    config: Config,
    store: Arc<dyn KeyValueStore>,
    slots: Arc<SlotTable>,
    report_sender: Sender<NormalizedReport>,
    report_receiver: Receiver<NormalizedReport>,
    /// Running flag
    running: Arc<AtomicBool>,
    server: Option<Arc<ProtocolServer>>,
    workers: Vec<JoinHandle<()>>,
}

impl Bridge {
    /// Create a bridge backed by the JSON store named in the config
    pub fn new(config: Config) -> Self {
        let store = Arc::new(JsonFileStore::open(&config.storage.path));
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        let (report_sender, report_receiver) = bounded(REPORT_CHANNEL_CAPACITY);

        Self {
            config,
            store,
            slots: Arc::new(SlotTable::new()),
            report_sender,
            report_receiver,
            running: Arc::new(AtomicBool::new(false)),
            server: None,
            workers: Vec::new(),
        }
    }

    /// Bind the server and start the server and pump threads.
    ///
    /// Returns the address the server actually bound.
    pub fn start(&mut self) -> Result<SocketAddr, BridgeError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        let addr = self.config.server.socket_addr()?;

        info!("Starting DSU Bridge...");
        let (server, handle) = self.start_server_thread(addr)?;
        let local = server.local_addr().map_err(ServerError::from)?;

        self.running.store(true, Ordering::SeqCst);
        self.start_pump_thread(Arc::clone(&server), handle)?;
        self.server = Some(server);

        info!("✓ Bridge started on {}", local);
        Ok(local)
    }

    /// Stop the server and join the worker threads
    pub fn stop(&mut self) {
        info!("Stopping DSU Bridge...");
        self.running.store(false, Ordering::SeqCst);

        if let Some(server) = self.server.take() {
            server.stop();
        }

        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("worker").to_string();
            if worker.join().is_err() {
                warn!("{} thread panicked", name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Channel sessions push their reports into
    pub fn report_sender(&self) -> Sender<NormalizedReport> {
        self.report_sender.clone()
    }

    pub fn slots(&self) -> Arc<SlotTable> {
        Arc::clone(&self.slots)
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn server(&self) -> Option<Arc<ProtocolServer>> {
        self.server.clone()
    }

    /// Build a session for a newly connected pad and bind it to a free slot
    pub fn new_session<T: HidTransport>(
        &self,
        address: DeviceAddress,
        transport: T,
    ) -> Result<Ds3Session<T>, BridgeError> {
        let slot = self
            .slots
            .reserve(address)
            .ok_or(BridgeError::NoFreeSlot(address))?;

        let session = Ds3Session::new(
            address,
            transport,
            Arc::clone(&self.store),
            SessionConfig::from(&self.config.pads),
        )
        .with_report_sender(self.report_sender.clone());
        session.set_slot(slot);

        info!("DS3 {} assigned to slot {:?}", address, slot);
        Ok(session)
    }

    /// Close a session and free its slot
    pub fn end_session<T: HidTransport>(&self, session: &Ds3Session<T>) {
        session.close();
        self.slots.release(session.slot());
        session.set_slot(PadId::None);
    }

    /// Server thread: owns the runtime the socket is registered with
    fn start_server_thread(
        &mut self,
        addr: SocketAddr,
    ) -> Result<(Arc<ProtocolServer>, Handle), BridgeError> {
        let (ready_sender, ready_receiver) = bounded(1);
        let pads: Arc<dyn PadInfoProvider> = self.slots.clone();
        let settings = WireSettings::from(&self.config.pads);

        let worker = thread::Builder::new()
            .name("dsu-server".to_string())
            .spawn(move || {
                let rt = match Runtime::new() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_sender.send(Err(BridgeError::Worker(e)));
                        return;
                    }
                };

                let server = match rt.block_on(ProtocolServer::bind(addr, pads, settings)) {
                    Ok(server) => Arc::new(server),
                    Err(e) => {
                        let _ = ready_sender.send(Err(BridgeError::Server(e)));
                        return;
                    }
                };

                if ready_sender
                    .send(Ok((Arc::clone(&server), rt.handle().clone())))
                    .is_err()
                {
                    return;
                }

                info!("Server thread started");
                rt.block_on(server.run());
                info!("Server thread exited");
            })?;
        self.workers.push(worker);

        ready_receiver.recv().map_err(|_| BridgeError::Startup)?
    }

    /// Pump thread: reports from the channel to the slot table and server
    fn start_pump_thread(&mut self, server: Arc<ProtocolServer>, handle: Handle) -> Result<(), BridgeError> {
        let receiver = self.report_receiver.clone();
        let running = Arc::clone(&self.running);
        let slots = Arc::clone(&self.slots);

        let worker = thread::Builder::new()
            .name("report-pump".to_string())
            .spawn(move || {
                info!("Report pump started");

                while running.load(Ordering::SeqCst) {
                    match receiver.recv_timeout(PUMP_POLL_INTERVAL) {
                        Ok(report) => {
                            slots.update(report.meta());
                            let sent = handle.block_on(server.broadcast(&report));
                            if sent > 0 {
                                debug!("Report {} from {} sent to {} client(s)", report.packet_counter, report.address, sent);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                info!("Report pump exited");
            })?;
        self.workers.push(worker);

        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
    }
}
