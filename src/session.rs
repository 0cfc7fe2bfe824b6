//! The command queue that serialises every change to filters, configuration
//! and the running tunnel.

use crate::config::{BlockaConfig, TunnelConfig};
use crate::engine::{DomainMatcher, Filter, FilterManager};
use crate::error::{TunnelError, TunnelResult};
use crate::events::EventBus;
use crate::logger::{MemoryLogSink, Request};
use crate::persistence::{Persistence, PersistenceExt, KEY_BLOCKA_CONFIG, KEY_TUNNEL_CONFIG};
use crate::stats::StatsCollector;
use crate::tunnel::{
    DnsAddressing, DnsProxy, Forwarder, Interceptor, LayoutKind, Loopback, ProtectedSockets,
    Proxy, RunnerSettings, SystemClock, TunnelHandle, VpnLayout, WgProxy,
};
use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Device-bound packets that may wait at once.
const LOOPBACK_BUFFERS: usize = 64;
const COMMAND_QUEUE: usize = 64;

pub enum Command {
    SetUrl(String),
    PutFilter(Filter),
    SetFilterActive {
        id: String,
        active: bool,
        reply: oneshot::Sender<bool>,
    },
    RemoveFilter(String),
    RemoveAll,
    InvalidateCache,
    Sync(oneshot::Sender<bool>),
    SetTunnelConfig(TunnelConfig),
    SetBlockaConfig(BlockaConfig),
    /// New upstream DNS servers. An empty list stops the tunnel.
    Setup(Vec<SocketAddr>),
    Start {
        device: Arc<OwnedFd>,
        reply: oneshot::Sender<TunnelResult<VpnLayout>>,
    },
    Stop(oneshot::Sender<()>),
    Filters(oneshot::Sender<Vec<Filter>>),
    Status(oneshot::Sender<SessionStatus>),
    RecentRequests(oneshot::Sender<Vec<Request>>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub running: bool,
    pub mode: Option<LayoutKind>,
    pub filters: usize,
    pub servers: Vec<SocketAddr>,
    pub tunnel: TunnelConfig,
}

#[derive(Clone)]
pub struct SessionSettings {
    pub servers: Vec<SocketAddr>,
    pub mtu: usize,
    pub tunnel: TunnelConfig,
    pub blocka: BlockaConfig,
    pub sockets: ProtectedSockets,
}

/// State owned by the `tunnel-ctrl` task. Nothing else touches it.
pub struct Session {
    manager: FilterManager,
    persistence: Arc<dyn Persistence>,
    events: EventBus,
    stats: Arc<StatsCollector>,
    requests: MemoryLogSink,
    tunnel_config: TunnelConfig,
    blocka_config: BlockaConfig,
    servers: Vec<SocketAddr>,
    sockets: ProtectedSockets,
    mtu: usize,
    device: Option<Arc<OwnedFd>>,
    tunnel: Option<TunnelHandle>,
    mode: Option<LayoutKind>,
}

impl Session {
    /// Persisted configuration wins over `settings`, which only provides the
    /// defaults for a first run.
    pub fn new(
        mut manager: FilterManager,
        persistence: Arc<dyn Persistence>,
        events: EventBus,
        stats: Arc<StatsCollector>,
        requests: MemoryLogSink,
        settings: SessionSettings,
    ) -> Self {
        let tunnel_config = load_or(&*persistence, KEY_TUNNEL_CONFIG, settings.tunnel);
        let blocka_config = load_or(&*persistence, KEY_BLOCKA_CONFIG, settings.blocka);
        manager.set_config(tunnel_config.clone());
        manager.load();

        Self {
            manager,
            persistence,
            events,
            stats,
            requests,
            tunnel_config,
            blocka_config,
            servers: settings.servers,
            sockets: settings.sockets,
            mtu: settings.mtu,
            device: None,
            tunnel: None,
            mode: None,
        }
    }

    /// Moves the session onto its own task and returns the handle to it.
    pub fn spawn(self) -> SessionHandle {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        tokio::spawn(self.run(rx).instrument(info_span!("tunnel-ctrl")));
        SessionHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Session started");
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        self.stop_tunnel().await;
        self.manager.save().await;
        debug!("Session finished");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SetUrl(url) => {
                self.manager.set_url(&url);
                self.manager.save().await;
            }
            Command::PutFilter(filter) => {
                self.manager.put(filter);
                self.manager.save().await;
            }
            Command::SetFilterActive { id, active, reply } => {
                let found = self.manager.set_active(&id, active);
                self.manager.save().await;
                let _ = reply.send(found);
            }
            Command::RemoveFilter(id) => {
                self.manager.remove(&id);
                self.manager.save().await;
            }
            Command::RemoveAll => {
                self.manager.remove_all();
                self.manager.save().await;
            }
            Command::InvalidateCache => {
                self.manager.invalidate_cache();
                self.manager.save().await;
            }
            Command::Sync(reply) => {
                let built = self.sync().await;
                let _ = reply.send(built);
            }
            Command::SetTunnelConfig(config) => {
                self.set_tunnel_config(config);
                self.restart_if_running().await;
            }
            Command::SetBlockaConfig(config) => {
                if let Err(e) = self.persistence.write(KEY_BLOCKA_CONFIG, &config) {
                    error!("Failed saving blocka config: {:#}", e);
                }
                self.blocka_config = config;
                self.restart_if_running().await;
            }
            Command::Setup(servers) => {
                self.servers = servers;
                if self.servers.is_empty() {
                    warn!("No DNS servers, stopping the tunnel");
                    self.stop_tunnel().await;
                } else {
                    self.restart_if_running().await;
                }
            }
            Command::Start { device, reply } => {
                let result = self.start(device).await;
                if let Err(e) = &result {
                    error!("Failed starting tunnel: {}", e);
                }
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                self.stop_tunnel().await;
                self.device = None;
                let _ = reply.send(());
            }
            Command::Filters(reply) => {
                let _ = reply.send(self.manager.filters().to_vec());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::RecentRequests(reply) => {
                let _ = reply.send(self.requests.recent());
            }
        }
    }

    async fn sync(&mut self) -> bool {
        let built = self.manager.sync().await;
        if built && self.tunnel_config.first_load {
            info!("First filter load complete");
            let config = TunnelConfig {
                first_load: false,
                ..self.tunnel_config.clone()
            };
            self.set_tunnel_config(config);
        }
        built
    }

    fn set_tunnel_config(&mut self, config: TunnelConfig) {
        if let Err(e) = self.persistence.write(KEY_TUNNEL_CONFIG, &config) {
            error!("Failed saving tunnel config: {:#}", e);
        }
        self.manager.set_config(config.clone());
        self.tunnel_config = config;
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            running: self.tunnel.as_ref().is_some_and(TunnelHandle::is_running),
            mode: self.mode,
            filters: self.manager.filters().len(),
            servers: self.servers.clone(),
            tunnel: self.tunnel_config.clone(),
        }
    }

    fn vpn_enabled(&self) -> bool {
        self.blocka_config.vpn && self.blocka_config.has_gateway()
    }

    fn layout(&self) -> TunnelResult<VpnLayout> {
        let apps = self.manager.whitelisted_apps();
        if self.vpn_enabled() {
            VpnLayout::vpn(&self.servers, apps, &self.blocka_config)
        } else {
            Ok(VpnLayout::dns(&self.servers, apps))
        }
    }

    async fn start(&mut self, device: Arc<OwnedFd>) -> TunnelResult<VpnLayout> {
        self.stop_tunnel().await;
        if self.servers.is_empty() {
            return Err(TunnelError::Config("No DNS servers configured".to_string()));
        }
        let layout = self.layout()?;

        let matcher: Arc<dyn DomainMatcher> = self.manager.blockade().clone();
        let addressing = DnsAddressing::new(self.servers.clone());
        let events = self.events.clone();
        let stats = self.stats.clone();
        let sockets = self.sockets.clone();
        let blocka = self.blocka_config.clone();
        let mtu = self.mtu;
        let vpn = layout.kind == LayoutKind::Vpn;

        let make_proxy = move || -> TunnelResult<Box<dyn Proxy>> {
            let interceptor = Interceptor::new(
                matcher.clone(),
                addressing.clone(),
                events.clone(),
                stats.clone(),
            );
            let loopback = Loopback::new(LOOPBACK_BUFFERS, mtu);
            if vpn {
                let proxy = WgProxy::new(&blocka, interceptor, &sockets, loopback, stats.clone(), mtu)?;
                Ok(Box::new(proxy))
            } else {
                Ok(Box::new(DnsProxy::new(
                    interceptor,
                    Forwarder::new(Arc::new(SystemClock)),
                    Arc::new(sockets.clone()),
                    loopback,
                    stats.clone(),
                )))
            }
        };

        let settings = RunnerSettings {
            mtu: self.mtu,
            powersave: self.tunnel_config.powersave,
        };
        let handle = TunnelHandle::start(
            device.clone(),
            self.events.clone(),
            self.stats.clone(),
            settings,
            make_proxy,
        )?;
        info!("Tunnel running in {:?} mode", layout.kind);
        self.tunnel = Some(handle);
        self.device = Some(device);
        self.mode = Some(layout.kind);
        Ok(layout)
    }

    /// Joins the poll thread and saves the request log on the blocking
    /// pool, so the command task's worker stays free meanwhile.
    async fn stop_tunnel(&mut self) {
        self.mode = None;
        let Some(mut handle) = self.tunnel.take() else {
            return;
        };
        let requests = self.requests.clone();
        let persistence = self.persistence.clone();
        let stopped = task::spawn_blocking(move || {
            handle.stop();
            if let Err(e) = requests.persist(&*persistence) {
                warn!("Failed saving recent requests: {:#}", e);
            }
        })
        .await;
        if let Err(e) = stopped {
            error!("Tunnel stop task failed: {}", e);
        }
    }

    /// Applies configuration changes to a live tunnel by starting it again on
    /// the same device.
    async fn restart_if_running(&mut self) {
        if self.tunnel.is_none() {
            return;
        }
        let Some(device) = self.device.clone() else {
            return;
        };
        debug!("Restarting tunnel to apply new configuration");
        if let Err(e) = self.start(device).await {
            error!("Failed restarting tunnel: {}", e);
        }
    }
}

fn load_or<T>(persistence: &dyn Persistence, key: &str, default: T) -> T
where
    T: serde::de::DeserializeOwned + Clone,
{
    match persistence.read(key, default.clone()) {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to load {}, using defaults: {:#}", key, e);
            default
        }
    }
}

/// Cheap, cloneable access to a running [`Session`].
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("Session is no longer running"))
    }

    async fn ask<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| anyhow!("Session dropped the request"))
    }

    pub async fn set_url(&self, url: impl Into<String>) -> Result<()> {
        self.send(Command::SetUrl(url.into())).await
    }

    pub async fn put_filter(&self, filter: Filter) -> Result<()> {
        self.send(Command::PutFilter(filter)).await
    }

    pub async fn set_filter_active(&self, id: impl Into<String>, active: bool) -> Result<bool> {
        let id = id.into();
        self.ask(|reply| Command::SetFilterActive { id, active, reply }).await
    }

    pub async fn remove_filter(&self, id: impl Into<String>) -> Result<()> {
        self.send(Command::RemoveFilter(id.into())).await
    }

    pub async fn remove_all(&self) -> Result<()> {
        self.send(Command::RemoveAll).await
    }

    pub async fn invalidate_cache(&self) -> Result<()> {
        self.send(Command::InvalidateCache).await
    }

    pub async fn sync(&self) -> Result<bool> {
        self.ask(Command::Sync).await
    }

    pub async fn set_tunnel_config(&self, config: TunnelConfig) -> Result<()> {
        self.send(Command::SetTunnelConfig(config)).await
    }

    pub async fn set_blocka_config(&self, config: BlockaConfig) -> Result<()> {
        self.send(Command::SetBlockaConfig(config)).await
    }

    pub async fn setup(&self, servers: Vec<SocketAddr>) -> Result<()> {
        self.send(Command::Setup(servers)).await
    }

    pub async fn start(&self, device: Arc<OwnedFd>) -> Result<VpnLayout> {
        let layout = self.ask(|reply| Command::Start { device, reply }).await?;
        Ok(layout?)
    }

    pub async fn stop(&self) -> Result<()> {
        self.ask(Command::Stop).await
    }

    pub async fn filters(&self) -> Result<Vec<Filter>> {
        self.ask(Command::Filters).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.ask(Command::Status).await
    }

    pub async fn recent_requests(&self) -> Result<Vec<Request>> {
        self.ask(Command::RecentRequests).await
    }
}
