//! Task hub server library
//!
//! This module exports the core components for testing and integration.

pub mod api;
pub mod auth;
pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod mcp;
pub mod notifications;
pub mod services;
pub mod tools;
pub mod types;
