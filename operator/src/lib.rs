pub mod builder;
pub mod cli;
pub mod config;
pub mod context;
pub mod controller;
pub mod crd;
pub mod deploy;
pub mod error;
pub mod event;
pub mod eventing;
pub mod finalizer;
pub mod leader;
pub mod metrics;
pub mod receiver;
pub mod reconcile;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod templates;
pub mod validation;

#[cfg(test)]
mod testing;
