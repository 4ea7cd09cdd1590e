//! Provisions one ephemeral GitHub Actions runner per queued `workflow_job`
//! webhook: verify the delivery, mint a JIT runner config, launch a sandbox.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ghapp;
pub mod models;
pub mod runners;
pub mod server;
pub mod signature;
