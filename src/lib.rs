//! # smsgate - Serialized GSM Modem Gateway
//!
//! smsgate drives a single GSM modem over a serial link with AT commands and
//! turns it into a small, well-behaved SMS service.
//!
//! ## Features
//!
//! - **One Modem, One Operation**: every request goes through a single worker, so AT exchanges never interleave.
//! - **Unicode Aware Sending**: GSM-7 or UCS-2 is chosen from the text, long texts are split into parts.
//! - **SMSC Fallback**: configured service center first, then the SIM's own, then no override.
//! - **Connectivity Tracking**: Online / Offline derived from the last success and a failure window.
//! - **Durable Counters**: sent count and total cost survive restarts and crashes mid-write.
//! - **Inbox Monitor**: periodic listing with de-duplication and optional auto-delete.
//! - **Status Events**: every change is published as a structured [`publisher::StatusEvent`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsgate::bridge::SmsBridge;
//! use smsgate::config::Config;
//! use smsgate::modem::serial::SerialModem;
//! use smsgate::publisher::LogPublisher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?.normalized();
//!     let modem = SerialModem::new(&config.modem.port, config.modem.baud_rate);
//!     let mut bridge = SmsBridge::build(modem, &config, Arc::new(LogPublisher))?;
//!     bridge.startup().await;
//!     bridge.start_monitor();
//!     tokio::signal::ctrl_c().await?;
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`encoding`] - GSM-7 / UCS-2 classification and segmentation
//! - [`validation`] - destination number and text checks
//! - [`connectivity`] - Online/Offline state from operation outcomes
//! - [`modem`] - the modem trait, AT command implementation and serial transport
//! - [`gateway`] - serialized request queue, retries, SMSC fallback
//! - [`counters`] - crash-safe persistent send counters
//! - [`monitor`] - periodic inbox polling
//! - [`publisher`] - status events and sinks
//! - [`bridge`] - wiring and the command boundary
//! - [`config`] - TOML configuration
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐   ┌─────────────────┐
//! │   SMS Bridge    │ ← │   SMS Monitor   │
//! └─────────────────┘   └─────────────────┘
//!          │
//! ┌─────────────────┐   ┌─────────────────┐
//! │  Modem Gateway  │ → │  Counter Store  │
//! │  (one worker)   │ → │  Connectivity   │
//! └─────────────────┘   └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  AT Modem over  │
//! │  serial port    │
//! └─────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod connectivity;
pub mod counters;
pub mod encoding;
pub mod error;
pub mod gateway;
pub mod logutil;
pub mod metrics;
pub mod modem;
pub mod monitor;
pub mod publisher;
pub mod validation;
