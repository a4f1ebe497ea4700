pub mod api;
pub mod bridge;
pub mod config;
pub mod discovery;
pub mod gateway;
pub mod ingest;
pub mod listener;
pub mod registry;
pub mod router;

pub use config::Config;
pub use gateway::Gateway;
pub use registry::{DeviceRecord, DeviceRegistry};
pub use router::{CommandOutcome, CommandRouter};
