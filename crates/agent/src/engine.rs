#![forbid(unsafe_code)]

use crate::backend::{
    Backend, BackendInfo, RegistryConnector, VmListenerBackend, VmMonitorBackend, VmPollingBackend,
};
use crate::backends::{CpuListenerFactory, IoStatAction, cpu, io};
use crate::clock::{Clock, SystemClock};
use crate::discovery::{
    HostListener, HsperfRegistry, MetadataExtractor, PerfDataExtractor, ProcessRegistry,
    VmBlacklist,
};
use crate::domain::{IdAllocator, UuidAllocator, VmId};
use crate::error::Error;
use crate::gateway::{Gateway, GatewayVmInfoSink, LogGateway, NoopGateway};
use crate::notifier::VmStatusChangeNotifier;
use config::Config;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const MONITOR_NAME: &str = "vm-monitor";

pub struct Services {
    pub gateway: Arc<dyn Gateway>,
    pub clock: Arc<dyn Clock>,
    pub ids: Box<dyn IdAllocator>,
    pub extractor: Box<dyn MetadataExtractor>,
    pub connector: RegistryConnector,
}

impl Services {
    /// Production services: hsperfdata discovery, procfs metadata and a
    /// logging gateway.
    pub fn system(config: &Config) -> Self {
        let gateway: Arc<dyn Gateway> = if config.gateway.enabled {
            Arc::new(LogGateway::new(config.gateway.url.clone()))
        } else {
            Arc::new(NoopGateway)
        };
        let root = config.discovery.hsperfdata_root.clone();
        let proc_root = config.discovery.proc_root.clone();
        let extractor = PerfDataExtractor::new(root.clone(), proc_root.clone());
        Self {
            gateway,
            clock: Arc::new(SystemClock),
            ids: Box::new(UuidAllocator),
            extractor: Box::new(extractor),
            connector: Box::new(move || {
                HsperfRegistry::connect(root.clone(), proc_root.clone())
                    .map(|registry| Box::new(registry) as Box<dyn ProcessRegistry>)
            }),
        }
    }
}

pub enum ControlEvent {
    Reload(Box<Config>),
    DumpStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub name: String,
    pub active: bool,
    pub monitored: usize,
}

#[derive(Debug, Clone)]
pub struct AgentStatus {
    pub writer_id: String,
    pub active_vms: BTreeMap<u32, VmId>,
    pub listeners: usize,
    pub blacklist_filters: usize,
    pub backends: Vec<BackendStatus>,
}

/// Wires discovery, the notifier and the per-metric backends together.
pub struct AgentEngine {
    config: Config,
    writer_id: String,
    notifier: Arc<VmStatusChangeNotifier>,
    blacklist: Arc<VmBlacklist>,
    monitor: VmMonitorBackend,
    io: VmPollingBackend,
    cpu: VmListenerBackend,
}

impl AgentEngine {
    pub fn new(config: Config, services: Services) -> Result<Self, Error> {
        let writer_id = config
            .agent
            .writer_id
            .clone()
            .unwrap_or_else(|| UuidAllocator.allocate().to_string());
        let notifier = Arc::new(VmStatusChangeNotifier::new());
        let blacklist = Arc::new(VmBlacklist::from_patterns(&config.discovery.blacklist)?);

        let listener = HostListener::new(
            writer_id.clone(),
            Arc::clone(&notifier),
            Arc::clone(&blacklist),
            services.extractor,
        )
        .with_ids(services.ids)
        .with_sink(Arc::new(GatewayVmInfoSink::new(Arc::clone(&services.gateway))))
        .with_clock(Arc::clone(&services.clock));
        let monitor = VmMonitorBackend::new(
            BackendInfo::new(MONITOR_NAME, "Discovers JVMs running on this host"),
            listener,
            services.connector,
            config.discovery.poll_interval,
        );

        let queue = config.backends.listener_queue;
        let io = io::backend(
            Arc::clone(&notifier),
            &config.backends.io,
            queue,
            IoStatAction::new(
                writer_id.clone(),
                config.discovery.proc_root.clone(),
                Arc::clone(&services.gateway),
                Arc::clone(&services.clock),
            ),
        );
        let cpu = cpu::backend(
            Arc::clone(&notifier),
            &config.backends.cpu,
            queue,
            CpuListenerFactory::new(
                writer_id.clone(),
                config.discovery.proc_root.clone(),
                Arc::clone(&services.gateway),
                Arc::clone(&services.clock),
            ),
        );

        Ok(Self {
            config,
            writer_id,
            notifier,
            blacklist,
            monitor,
            io,
            cpu,
        })
    }

    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    pub fn notifier(&self) -> &Arc<VmStatusChangeNotifier> {
        &self.notifier
    }

    pub fn blacklist(&self) -> &Arc<VmBlacklist> {
        &self.blacklist
    }

    pub fn io_backend(&self) -> &VmPollingBackend {
        &self.io
    }

    pub fn cpu_backend(&self) -> &VmListenerBackend {
        &self.cpu
    }

    /// Activate every enabled backend. Returns false when discovery is
    /// enabled but could not be started; metric backends stay up either way.
    pub fn start(&self) -> bool {
        let discovery = self.apply_enabled();
        info!(writer_id = %self.writer_id, discovery, "agent started");
        discovery || !self.config.discovery.enabled
    }

    pub fn stop(&self) {
        self.monitor.deactivate();
        self.io.deactivate();
        self.cpu.deactivate();
        info!(writer_id = %self.writer_id, "agent stopped");
    }

    /// Apply a new configuration. Blacklist, observe flags and enabled flags
    /// take effect immediately; intervals, paths and the gateway only on
    /// restart.
    pub fn reload(&mut self, config: Config) -> Result<(), Error> {
        let filters = VmBlacklist::parse_patterns(&config.discovery.blacklist)?;
        self.blacklist.replace_filters(filters);

        if config.discovery.poll_interval != self.config.discovery.poll_interval
            || config.discovery.hsperfdata_root != self.config.discovery.hsperfdata_root
            || config.gateway != self.config.gateway
        {
            warn!("discovery and gateway settings change on restart only");
        }

        self.io.set_observe_new_jvm(config.backends.io.observe_new_jvm);
        self.cpu.set_observe_new_jvm(config.backends.cpu.observe_new_jvm);
        self.config = config;
        self.apply_enabled();
        info!("config reloaded");
        Ok(())
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            writer_id: self.writer_id.clone(),
            active_vms: self.notifier.active_vms(),
            listeners: self.notifier.listener_count(),
            blacklist_filters: self.blacklist.len(),
            backends: vec![
                BackendStatus {
                    name: self.monitor.info().name.clone(),
                    active: self.monitor.is_active(),
                    monitored: self.notifier.active_vms().len(),
                },
                BackendStatus {
                    name: self.io.info().name.clone(),
                    active: self.io.is_active(),
                    monitored: self.io.monitored_vms().len(),
                },
                BackendStatus {
                    name: self.cpu.info().name.clone(),
                    active: self.cpu.is_active(),
                    monitored: self.cpu.monitored_vms().len(),
                },
            ],
        }
    }

    pub fn dump_status(&self) -> AgentStatus {
        let status = self.status();
        info!(?self.config, "current config");
        info!(
            writer_id = %status.writer_id,
            active_vms = status.active_vms.len(),
            listeners = status.listeners,
            blacklist_filters = status.blacklist_filters,
            "agent status"
        );
        for backend in &status.backends {
            info!(backend = %backend.name, active = backend.active, monitored = backend.monitored, "backend status");
        }
        status
    }

    /// Start, then serve control events until `cancel` fires, then stop.
    pub async fn run_until(
        &mut self,
        cancel: CancellationToken,
        mut control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    ) -> Result<(), Error> {
        self.start();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                Some(event) = control_rx.recv() => {
                    match event {
                        ControlEvent::Reload(config) => {
                            if let Err(err) = self.reload(*config) {
                                warn!(%err, "reload rejected; keeping previous config");
                            }
                        }
                        ControlEvent::DumpStatus => {
                            self.dump_status();
                        }
                    }
                }
            }
        }
        self.stop();
        Ok(())
    }

    fn apply_enabled(&self) -> bool {
        sync_backend(&self.io, self.config.backends.io.enabled);
        sync_backend(&self.cpu, self.config.backends.cpu.enabled);
        sync_backend(&self.monitor, self.config.discovery.enabled)
    }
}

fn sync_backend(backend: &dyn Backend, enabled: bool) -> bool {
    if enabled {
        backend.activate()
    } else {
        backend.deactivate();
        false
    }
}
