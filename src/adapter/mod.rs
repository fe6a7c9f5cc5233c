//! Tunnel adapter orchestration
//!
//! [`Adapter`] owns the engine handle, the session table, the timer, and the
//! byte counters, and funnels every mutation through a single driver task:
//! commands from the public API, packet batches from the virtual interface,
//! datagram batches from the UDP sessions, and timer ticks all land on the
//! same task, so engine state is never touched concurrently. Engine callbacks
//! fire synchronously inside engine calls and inherit that serialization.

mod session;
mod stats;

pub use stats::TrafficCounters;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::TunnelConfig;
use crate::engine::{EngineApi, EngineHandle, EngineOutput};
use crate::error::AdapterError;
use crate::platform::{SettingsHost, TransportProvider, VirtualInterface};
use crate::settings::{self, DeviceProfile};
use session::SessionTable;

/// Delay before the first engine tick
const TICK_FIRST_DELAY: Duration = Duration::from_millis(10);

/// Engine tick period
const TICK_PERIOD: Duration = Duration::from_millis(500);

/// How long start waits for the platform to acknowledge network settings
const SETTINGS_WAIT: Duration = Duration::from_secs(5);

/// Depth of the session-reader to driver channel, in batches
const DATAGRAM_CHANNEL_DEPTH: usize = 64;

/// Adapter lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdapterState {
    Idle,
    Starting,
    Running,
    Stopping,
    /// Settings installed to firewall traffic, no engine running
    Blocked,
}

enum Command {
    Start(TunnelConfig, oneshot::Sender<Result<(), AdapterError>>),
    Stop(oneshot::Sender<()>),
    Update(TunnelConfig, oneshot::Sender<Result<(), AdapterError>>),
    Block(TunnelConfig, oneshot::Sender<Result<(), AdapterError>>),
}

/// Handle to a running tunnel adapter.
///
/// `start`, `stop`, `update`, and `block` enqueue onto the driver task and
/// await completion, which serializes them with any in-flight mutation.
/// `stats` and `interface_name` are safe from any thread. Dropping the handle
/// shuts the driver down, stopping any active tunnel.
pub struct Adapter {
    commands: mpsc::UnboundedSender<Command>,
    counters: Arc<TrafficCounters>,
    tun: Arc<dyn VirtualInterface>,
}

impl Adapter {
    /// Spawn the adapter's driver task. Must be called in a tokio runtime.
    pub fn new(
        engine_api: EngineApi,
        tun: Arc<dyn VirtualInterface>,
        transport: Arc<dyn TransportProvider>,
        settings_host: Arc<dyn SettingsHost>,
        profile: DeviceProfile,
    ) -> Self {
        let counters = Arc::new(TrafficCounters::default());
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine_api,
            tun: Arc::clone(&tun),
            transport,
            settings_host,
            profile,
            counters: Arc::clone(&counters),
            commands: command_rx,
            state: AdapterState::Idle,
            engine: None,
            sessions: SessionTable::new(),
            timer: None,
            datagrams: None,
        };
        tokio::spawn(driver.run());

        Self {
            commands,
            counters,
            tun,
        }
    }

    /// Bring the tunnel up for `config`
    pub async fn start(&self, config: TunnelConfig) -> Result<(), AdapterError> {
        self.roundtrip(|reply| Command::Start(config, reply)).await?
    }

    /// Tear down and restart with `config`, zeroing the byte counters
    pub async fn update(&self, config: TunnelConfig) -> Result<(), AdapterError> {
        self.roundtrip(|reply| Command::Update(config, reply)).await?
    }

    /// Install routing/DNS settings only, with no engine: traffic routed at
    /// the tunnel is dropped until the next start
    pub async fn block(&self, config: TunnelConfig) -> Result<(), AdapterError> {
        self.roundtrip(|reply| Command::Block(config, reply)).await?
    }

    /// Tear the tunnel down. Idempotent; serialized with any in-flight
    /// mutation; cannot fail.
    pub async fn stop(&self) {
        let _ = self.roundtrip(|reply| Command::Stop(reply)).await;
    }

    /// Wait-free snapshot of `(bytes_received, bytes_sent)`
    pub fn stats(&self) -> (u64, u64) {
        self.counters.snapshot()
    }

    /// Name of the virtual interface, best effort
    pub fn interface_name(&self) -> Option<String> {
        self.tun
            .name()
            .or_else(crate::platform::utun::discover_interface_name)
    }

    async fn roundtrip<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, AdapterError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AdapterError::ShutDown)?;
        reply_rx.await.map_err(|_| AdapterError::ShutDown)
    }
}

struct Driver {
    engine_api: EngineApi,
    tun: Arc<dyn VirtualInterface>,
    transport: Arc<dyn TransportProvider>,
    settings_host: Arc<dyn SettingsHost>,
    profile: DeviceProfile,
    counters: Arc<TrafficCounters>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: AdapterState,
    engine: Option<EngineHandle>,
    sessions: SessionTable,
    timer: Option<Interval>,
    datagrams: Option<mpsc::Receiver<Vec<Vec<u8>>>>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let tun = Arc::clone(&self.tun);
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped; shut down
                    None => break,
                },
                batch = recv_datagrams(&mut self.datagrams), if self.engine.is_some() => {
                    match batch {
                        Some(batch) => self.on_datagrams(batch).await,
                        None => self.datagrams = None,
                    }
                },
                result = tun.read_packets(), if self.engine.is_some() => {
                    self.on_host_packets(result).await;
                },
                _ = next_tick(&mut self.timer), if self.timer.is_some() => {
                    self.on_tick().await;
                },
            }
        }
        self.stop_tunnel();
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(config, reply) => {
                let _ = reply.send(self.start_tunnel(config).await);
            }
            Command::Stop(reply) => {
                self.stop_tunnel();
                let _ = reply.send(());
            }
            Command::Update(config, reply) => {
                self.stop_tunnel();
                let _ = reply.send(self.start_tunnel(config).await);
            }
            Command::Block(config, reply) => {
                let _ = reply.send(self.block_tunnel(config).await);
            }
        }
    }

    async fn start_tunnel(&mut self, config: TunnelConfig) -> Result<(), AdapterError> {
        // A start on top of a live tunnel restarts it
        self.stop_tunnel();
        self.state = AdapterState::Starting;

        match self.start_inner(config).await {
            Ok(()) => {
                self.state = AdapterState::Running;
                tracing::info!("Tunnel up");
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Start failed: {}", e);
                self.stop_tunnel();
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self, config: TunnelConfig) -> Result<(), AdapterError> {
        self.counters.reset();

        // Timer first; ticks flow as soon as the loop resumes
        let mut timer = tokio::time::interval_at(Instant::now() + TICK_FIRST_DELAY, TICK_PERIOD);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.timer = Some(timer);

        // Single active peer per session: the engine runs against the first
        // peer that has a literal endpoint
        let (peer, endpoint) = config.first_routable_peer().ok_or(AdapterError::NoPeers)?;
        let engine = EngineHandle::init(
            self.engine_api,
            config.interface.private_key,
            peer.public_key,
            endpoint,
            Arc::clone(&self.counters),
        )?;
        // The first virtual-interface read arms once the loop resumes
        self.engine = Some(engine);

        self.sessions
            .create_sessions(self.transport.as_ref(), &config)
            .await;
        self.sessions.await_ready().await;

        let (tx, rx) = mpsc::channel(DATAGRAM_CHANNEL_DEPTH);
        self.sessions.install_readers(tx);
        self.datagrams = Some(rx);

        let settings = settings::generate(&config, self.profile);
        self.apply_settings(&settings).await?;

        Ok(())
    }

    async fn block_tunnel(&mut self, config: TunnelConfig) -> Result<(), AdapterError> {
        self.stop_tunnel();

        let settings = settings::generate(&config, self.profile);
        self.apply_settings(&settings).await?;
        self.state = AdapterState::Blocked;
        tracing::info!("Blocking settings installed");
        Ok(())
    }

    async fn apply_settings(
        &self,
        settings: &settings::NetworkSettings,
    ) -> Result<(), AdapterError> {
        match tokio::time::timeout(SETTINGS_WAIT, self.settings_host.apply(settings)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AdapterError::NetworkSettings {
                reason: e.to_string(),
            }),
            Err(_) => Err(AdapterError::NetworkSettingsTimeout {
                seconds: SETTINGS_WAIT.as_secs(),
            }),
        }
    }

    /// Tear everything down: timer, then engine (after which no callback can
    /// fire), then sessions. Idempotent.
    fn stop_tunnel(&mut self) {
        if self.state != AdapterState::Idle {
            self.state = AdapterState::Stopping;
        }
        self.timer = None;
        self.engine = None;
        self.sessions.teardown();
        self.datagrams = None;
        if self.state != AdapterState::Idle {
            tracing::debug!("Tunnel down");
            self.state = AdapterState::Idle;
        }
    }

    async fn on_host_packets(
        &mut self,
        result: Result<Vec<crate::platform::Packet>, crate::error::TunnelError>,
    ) {
        let packets = match result {
            Ok(packets) => packets,
            Err(e) => {
                // Only this batch is lost; the read re-arms on the next loop
                tracing::debug!("Virtual interface read failed: {}", e);
                return;
            }
        };
        for packet in packets {
            let out = match self.engine.as_mut() {
                Some(engine) => engine.feed_host(&packet.bytes),
                None => return,
            };
            self.dispatch(out).await;
        }
    }

    async fn on_datagrams(&mut self, batch: Vec<Vec<u8>>) {
        for datagram in batch {
            let out = match self.engine.as_mut() {
                Some(engine) => engine.feed_tunnel(&datagram),
                None => return,
            };
            self.dispatch(out).await;
        }
    }

    async fn on_tick(&mut self) {
        let out = match self.engine.as_mut() {
            Some(engine) => engine.tick(),
            None => return,
        };
        self.dispatch(out).await;
    }

    /// Route one engine call's output: datagrams to their sessions, packets
    /// to the virtual interface.
    async fn dispatch(&self, out: EngineOutput) {
        for datagram in &out.datagrams {
            match self.sessions.lookup(&datagram.to) {
                Some(session) => match session.write_datagram(&datagram.bytes).await {
                    Ok(()) => self.counters.add_tx(datagram.bytes.len() as u64),
                    Err(e) => {
                        tracing::debug!("UDP write to {} failed: {}", datagram.to, e);
                    }
                },
                None => {
                    tracing::trace!("No open socket for {}, dropping datagram", datagram.to);
                }
            }
        }

        if !out.packets.is_empty() {
            if let Err(e) = self.tun.write_packets(&out.packets).await {
                tracing::debug!("Virtual interface write failed: {}", e);
            }
        }
    }
}

async fn recv_datagrams(rx: &mut Option<mpsc::Receiver<Vec<Vec<u8>>>>) -> Option<Vec<Vec<u8>>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}
