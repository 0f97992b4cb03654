pub mod config;
pub mod connection;
pub mod lease_watch;
pub mod logging;
pub mod manager;
pub mod scanner;
pub mod transport;

pub use config::{load_config, Args, DaemonConfig};
pub use manager::{ConnectionManager, ConnectionState, ManagerConfig, MonitorEvent, MonitorHandle};
pub use scanner::{LeaseScanner, ScannerConfig, SystemProcessProbe};
pub use transport::WebSocketTransport;
