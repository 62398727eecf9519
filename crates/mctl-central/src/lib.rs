//! Central controller for the Master Control fleet.
//!
//! Aggregates device heartbeats into the [`FleetStore`], proxies operator
//! commands to device daemons through the [`FleetClient`], and drives
//! rolling, health-gated deployments with the [`Deployer`].

pub mod api;
pub mod deployer;
pub mod fleet_client;
pub mod fleet_store;
pub mod inventory;

pub use deployer::{DeployError, Deployer};
pub use fleet_client::{FleetClient, FleetClientError};
pub use fleet_store::{FleetStore, FleetStoreError};
