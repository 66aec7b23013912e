//! Channel Access client core: shared channels, their state machine, and the DBR codec.
//!
//! This crate is the part of a [EPICS CA protocol] client that sits between the
//! application and the network. It does not do discovery or byte framing itself;
//! those belong to a [`transport::Transport`], which the core drives through a small
//! trait and which calls back into the core as responses arrive.
//!
//! The crate is split into:
//!
//! - Representing data for transferring back and forth (["DBR" types]) via CA, in
//!   module [dbr]. Every category (plain, status, time, graphics, control) can be
//!   packed and unpacked.
//! - The [transport] boundary, with an in-memory [`transport::loopback`]
//!   implementation that serves a local PV database.
//! - The [client] layer: a [`client::Registry`] that shares one
//!   [`client::Channel`] per PV name, each channel publishing its state as an
//!   immutable [`client::ChannelSnapshot`] and offering connect, get, put and
//!   subscribe operations with timeouts.
//! - [config], explicit or read from the usual `EPICS_CA_*` environment.
//!
//! ## Example
//!
//! ```
//! # use std::sync::Arc;
//! use epicars_client::{
//!     client::{ReadOutcome, Registry},
//!     config::ClientConfig,
//!     transport::loopback::LoopbackTransport,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(LoopbackTransport::new());
//!     transport.add_pv("NUMERIC_VALUE", 42i32).unwrap();
//!     let registry = Registry::new(ClientConfig::default(), transport);
//!
//!     let channel = registry.get_or_create("NUMERIC_VALUE");
//!     if let ReadOutcome::Success(value) = channel.connect_and_acquire_value().await {
//!         assert_eq!(value.as_scalar::<i32>(), Some(42));
//!     }
//! }
//! ```
//!
//! [EPICS CA protocol]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html
//! ["DBR" types]:
//!     https://docs.epics-controls.org/en/latest/internal/ca_protocol.html#payload-data-types

pub mod client;
pub mod config;
pub mod dbr;
pub mod transport;

pub use crate::client::{Channel, Registry};
pub use crate::config::ClientConfig;
