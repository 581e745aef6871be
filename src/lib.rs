pub mod config;
pub mod debrid;
pub mod http;
pub mod magnet;
pub mod rss;
pub mod run;

pub use config::{Config, ConfigStore, Credential};
pub use debrid::DebridClient;
pub use run::{RunContext, RunSummary};
