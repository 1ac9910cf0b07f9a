//! Purpose: Library crate behind the `shieldexec` server and its tests.
//! Exports: `core` (errors, values, commands, validation), `engine`, `session`, `link`, `rewrite`, `workspace`, `serve`.
//! Role: Per-session command execution against remote statistical interpreters.
//! Invariants: One worker thread per (user, profile) session owns that session's interpreter link.
//! Invariants: Expressions are rewritten and validated before anything is queued.
pub mod catalog;
pub mod core;
pub mod engine;
pub mod link;
pub mod ops;
pub mod packages;
pub mod rewrite;
pub mod serve;
pub mod session;
pub mod workspace;
