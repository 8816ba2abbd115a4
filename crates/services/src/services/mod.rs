pub mod config;
pub mod container;
pub mod executor;
pub mod gate;
pub mod github_client;
pub mod job;
pub mod notification;
pub mod orchestrator;
pub mod webhook;
