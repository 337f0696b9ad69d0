//! Bridges the Hades Live control socket and Twitch chat over a topic bus.

pub mod app;
pub mod chat;
pub mod cli;
pub mod config;
pub mod controller;
pub mod status;
pub mod telemetry;
pub mod transport;
