//! Connection and live-state synchronization for OpenCode-compatible agent
//! servers running in remote workspaces.

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod invalidation;
pub mod polling;
pub mod registry;
pub mod sdk;
pub mod testing;
pub mod transport;
pub mod types;

pub use cache::{Query, QueryCache, QueryState};
pub use client::SyncClient;
pub use config::{SyncConfig, TransportMode};
pub use dispatcher::{EventDispatcher, EventListener, ListenerError, ListenerFilter, Subscription};
pub use event::{EventCategory, EventEnvelope, ServerEvent};
pub use invalidation::{map_event_to_keys, CacheBridge, QueryKey, QueryKind};
pub use polling::PollingConfig;
pub use registry::{
    Connection, ConnectionLease, ConnectionRegistry, ConnectionState, ConnectionStatus,
};
pub use sdk::OpencodeClient;
pub use transport::{
    ApiRequest, EventStream, HttpTransport, HttpTransportFactory, Method, Transport,
    TransportFactory,
};
pub use workbench_error::SyncError;
