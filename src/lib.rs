//! Turbo chat delivery server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod broker;
pub mod chat;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod profile;
pub mod routes;
pub mod state;
pub mod ws;
