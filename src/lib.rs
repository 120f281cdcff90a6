//! ferry: blue/green release orchestration for Kubernetes
//!
//! Workflows in [`controller`] publish phases and move services between
//! their blue and green groups; the capturers in [`capture`] watch the
//! cluster and complete phases once workloads are ready.

pub mod capture;
pub mod config;
pub mod controller;
pub mod gateway;
pub mod model;
pub mod naming;
pub mod server;
pub mod store;
