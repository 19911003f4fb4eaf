//! Lead Outreach Orchestration Engine
//!
//! Scores leads, gates every outbound message through compliance rules,
//! dispatches email and voice outreach, turns inbound email into support
//! tickets and runs the whole pipeline on three cadences.
//!
//! # Modules
//!
//! - `scoring`: Deterministic lead scoring and status bucketing.
//! - `classification`: Keyword rules for inbound email.
//! - `intelligence`: Optional language-model client and the `LeadInsights` seam.
//! - `compliance`: Rule registry evaluated before every send.
//! - `templates`: Email bodies and call scripts.
//! - `dispatch`: Email and voice dispatchers.
//! - `email_client` / `voice_client`: HTTP provider clients.
//! - `inbound`: Inbound-email normalization and ticketing.
//! - `outcomes`: Contact outcome recording and follow-up scheduling.
//! - `reporting` / `retention`: Weekly aggregates and cleanup.
//! - `engine`: Operations the cadences and handlers drive.
//! - `scheduler`: Cadences, clock and single-flight runs.
//! - `repository` / `db_storage` / `db`: Lead store.
//! - `handlers` / `webhook_handler` / `api_docs`: HTTP surface.

pub mod api_docs;
pub mod bootstrap;
pub mod circuit_breaker;
pub mod classification;
pub mod compliance;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod dispatch;
pub mod email_client;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod inbound;
pub mod intelligence;
pub mod lead_locks;
pub mod models;
pub mod outcomes;
pub mod reporting;
pub mod repository;
pub mod retention;
pub mod scheduler;
pub mod scoring;
pub mod templates;
pub mod validation;
pub mod voice_client;
pub mod webhook_handler;
pub mod webhook_models;
