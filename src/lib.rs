//! Inbox Pilot: email triage and automation service.

pub mod config;
pub mod digest;
pub mod error;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod service;
pub mod sources;
pub mod store;
