//! Palaver: the real-time messaging hub of the chat backend.
//!
//! This library provides the WebSocket hub, rooms, the broker seam, and
//! the HTTP surface that upgrades clients into the messaging fabric.

pub mod api;
pub mod auth;
pub mod config;
pub mod social;
pub mod ws;
