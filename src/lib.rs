//! # Mailroom
//!
//! Commits the output of a flow engine and runs the bulk tasks behind it.
//!
//! ## Architecture
//!
//! ```text
//! Engine sprint -> Scenes -> Handlers -> Hooks -> Postgres / Redis
//! HTTP API -> Task queues -> Foremen -> Tasks -> Engine sprint
//! ```
//!
//! ## Modules
//!
//! - [`runner`]: the scene commit engine
//! - [`handlers`]: per-event handlers appending hook payloads to scenes
//! - [`hooks`]: batched writers run once per pass over every scene
//! - [`tasks`]: queued tasks and the workers which run them
//! - [`web`]: HTTP endpoints which queue tasks and work on definitions

pub mod config;
pub mod courier;
pub mod db;
pub mod engine;
pub mod event;
pub mod handlers;
pub mod hooks;
pub mod http;
pub mod models;
pub mod runner;
pub mod runtime;
pub mod scene;
pub mod search;
pub mod shutdown;
pub mod tasks;
pub mod web;

pub use event::Event;
pub use runtime::Runtime;
pub use scene::Scene;
