// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Client-side ingest multiplexer: fan-out delivery of tagged log/event
//! entries to one or more remote indexers over persistent, authenticated
//! connections, with automatic reconnection, tag negotiation, in-flight
//! entry recycling, and an optional disk-backed spool for all-down outages.
//!
//! [`Muxer`] is the entry point: build a [`MuxerConfig`], call
//! [`Muxer::new`], then [`Muxer::start`].

pub mod cache;
pub mod cfg;
pub mod emergency;
pub mod entry;
pub mod error;
pub mod indexer;
pub mod mux;
pub mod ratelimit;
pub mod tag;
pub mod utils;

pub use cfg::config::MuxerConfig;
pub use entry::{Batch, Entry, Timestamp};
pub use error::{MuxerError, Result};
pub use mux::{Muxer, Target, TargetError};
pub use tag::{LocalTagId, RemoteTagId};
