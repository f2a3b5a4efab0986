pub mod admin;
pub mod config;
pub mod error;
pub mod proxy;

pub use error::{ConnectError, ProxyError};
pub use proxy::{
    Backend, BackendConnector, BackendHandle, BackendPool, ConnectionRecord, ConnectionTracker,
    Listener, ListenerConfig, ListenerKind, Proxyer, ProxyStream, Target,
};
