//! Sendgate - Sender Rate Limiting Policy Daemon
//!
//! This crate implements a Postfix policy delegation server that defers
//! mail from senders exceeding a per-sender sliding-window limit. Limits
//! can be lifted per sender or domain through a whitelist and overridden
//! per domain, and live window state survives restarts through a snapshot
//! file.

pub mod config;
pub mod daemon;
pub mod error;
pub mod policy;
pub mod ratelimit;
