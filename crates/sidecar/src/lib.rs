// Domain-driven module structure for the service-discovery sidecar.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod health;
pub mod looper;
pub mod namer;
pub mod service;
pub mod snapshotter;
