//! Lhamascred Batch Lookup API Library
//!
//! Submits batches of CPFs to credit-bureau providers (V8, Facta, C6),
//! receives their asynchronous webhook answers and tracks each batch until
//! every item is accounted for.
//!
//! # Modules
//!
//! - `api`: HTTP-facing handlers.
//! - `core`: Domain models, validation and dispatch.
//! - `integrations`: Provider clients and webhook payloads.
//! - `circuit_breaker`: Circuit breaker around provider calls.
//! - `config`: Configuration management.
//! - `db`: Database connection pool and migrations.
//! - `db_storage`: Postgres batch store.
//! - `dispatcher`: Batch submission and provider fan-out.
//! - `errors`: Error handling types.
//! - `handlers`: Batch HTTP handlers and routers.
//! - `memory_storage`: In-process batch store.
//! - `models`: Batch and item models, progress rules.
//! - `providers`: Provider HTTP clients.
//! - `reaper`: Expiry of batches that never complete.
//! - `repository`: Storage trait shared by both stores.
//! - `validation`: CPF, birth date and phone validation.
//! - `webhook_handler`: Balance webhook receiver.
//! - `webhook_models`: Webhook payloads and API envelopes.

pub mod api;
pub mod core;
pub mod integrations;

pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod dispatcher;
pub mod errors;
pub mod handlers;
pub mod memory_storage;
pub mod models;
pub mod providers;
pub mod reaper;
pub mod repository;
pub mod validation;
pub mod webhook_handler;
pub mod webhook_models;
