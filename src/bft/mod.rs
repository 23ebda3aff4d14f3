//! This module contains the core of `tobft`, a Byzantine fault tolerant
//! total ordering consensus engine.
//!
//! Client requests submitted at any participant are batched, agreed upon
//! with a three phase protocol (pre-prepare, prepare, commit), and delivered
//! to the application in the same order at every correct participant,
//! together with a quorum certificate of signatures. A leader rotation
//! protocol replaces a faulty or partitioned leader without losing
//! in-flight proposals.

pub mod api;
pub mod collections;
pub mod consensus;
pub mod controller;
pub mod crypto;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod pool;
pub mod state;
pub mod state_collector;
pub mod types;
pub mod view;
pub mod view_change;
