//! schedarray — cross-platform batch job scheduler core.
//!
//! A SQLite-backed job queue ([`scheduler`]), a worker-pool dispatcher that
//! runs queued commands as subprocesses ([`dispatcher`], [`executor`],
//! [`pool`]), and a long-running service tying them together ([`service`]).
//! The remaining modules implement the CLI sub-commands.

pub mod job;
pub mod scheduler;
pub mod pool;
pub mod executor;
pub mod dispatcher;
pub mod service;

pub mod submit;
pub mod status;
pub mod list;
pub mod counts;
pub mod cancel;
pub mod delete;
pub mod cleanup;
pub mod service_cmd;
