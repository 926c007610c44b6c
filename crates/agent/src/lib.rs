#![forbid(unsafe_code)]

pub mod backend;
pub mod backends;
pub mod clock;
pub mod discovery;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod notifier;

pub use backend::{
    ActionError, Backend, BackendInfo, EXCEPTION_THRESHOLD, RegistryConnector, VmListenerBackend,
    VmListenerFactory, VmMonitorBackend, VmPollingAction, VmPollingBackend, VmUpdateListener,
};
pub use backends::{CpuListenerFactory, IoStatAction, VmCpuStat, VmIoStat};
pub use discovery::{
    HostListener, HsperfRegistry, MainClassFilter, MetadataExtractor, PerfDataExtractor,
    PollReport, ProcessRegistry, RegistryDelta, VmBlacklist, VmFilter, VmInfoSink,
};
pub use dispatch::QueuedListener;
pub use engine::{AgentEngine, AgentStatus, BackendStatus, ControlEvent, Services};
pub use error::Error;
pub use gateway::{Gateway, GatewayRequest, GatewayVmInfoSink, LogGateway, Method, NoopGateway};
pub use notifier::{VmStatusChangeNotifier, VmStatusListener};

pub use clock::{Clock, SystemClock};
pub use domain::{
    ActionId, IdAllocator, ListenerId, UuidAllocator, VmId, VmInfo, VmMetadata, VmStatus,
};
