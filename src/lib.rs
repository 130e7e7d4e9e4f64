pub mod client;
pub mod cohorts;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod execution;
pub mod federation;
pub mod oracle;
pub mod params;
pub mod server;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use config::{ComputeTarget, DeltaPolicy, FederationConfig, Strategy};
pub use error::{CflErr, Result};
pub use federation::{Federation, RoundSummary};
pub use params::ParameterMap;
pub use server::Server;
