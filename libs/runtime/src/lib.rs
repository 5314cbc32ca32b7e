pub mod config;
pub mod logging;

pub use config::{AppConfig, BrokerSection, CliArgs, LoggingConfig, Section, ServerConfig};
