//! Library crate for lan-sweep-rs: range enumeration, liveness probes, SSH
//! command fan-out, the scan orchestrator and its result store.
pub mod config;
pub mod error;
pub mod probe;
pub mod range;
pub mod scanner;
pub mod server;
pub mod session;
pub mod store;
pub mod types;

pub use error::ConfigError;
pub use range::AddressRange;
pub use scanner::{RunState, RunSummary, ScanHandle, ScanOptions, ScanOrchestrator, ScanRun};
pub use store::ResultStore;
