// Library exports for trialwatch crate
// This allows tests and the binary to use the modules

pub mod config;
pub mod crypto;
pub mod database;
pub mod detector;
pub mod error;
pub mod gmail_client;
pub mod models;
pub mod orchestrator;
pub mod queries;
pub mod scanner;
pub mod slack_notifier;
pub mod store;
