// credit-reconciler: identity and order-expiry reconciliation

pub mod app;
pub mod auth;
pub mod config;
pub mod core;
pub mod infra;
pub mod state;
