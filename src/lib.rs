#![deny(missing_docs)]
//! Activation bot library.
//!
//! Coordinates one-time activation of chat agents in group chats across a
//! fleet of bot instances, and relays conversation to the active agent.

/// Activation domain, lifecycle and event routing.
pub mod activation;
/// Telegram transport and update handlers.
pub mod bot;
/// Configuration management.
pub mod config;
/// Completion providers and client.
pub mod llm;
/// Agent personas and conversational replies.
pub mod persona;
/// Process wiring for the bot fleet.
pub mod runner;
/// Storage layer (memory and R2/S3).
pub mod storage;
/// Chat transport abstraction.
pub mod transport;
/// Utility functions.
pub mod utils;
/// User-facing message texts.
pub mod views;
