//! Areaplane world manager library.
//!
//! This crate primarily ships a `manager` binary, but we expose a library
//! surface to enable integration testing and embedding with other hosting
//! or DNS providers.

pub mod allocation;
pub mod api;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod dns;
pub mod error;
pub mod hosting;
pub mod model;
pub mod publisher;
pub mod scheduler;
pub mod state;
pub mod tasks;
