// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::cache::CacheError;

/// Errors surfaced across the public muxer API.
#[derive(Debug, Error)]
pub enum MuxerError {
    #[error("all connections are down")]
    AllConnsDown,

    #[error("muxer is not running")]
    NotRunning,

    #[error("muxer is not ready to start")]
    NotReady,

    #[error("tag {0:?} not found")]
    TagNotFound(String),

    #[error("tag table is invalid")]
    TagMapInvalid,

    #[error("no targets configured")]
    NoTargets,

    #[error("timed out waiting for a hot connection")]
    ConnectionTimeout,

    #[error("timed out waiting for sync")]
    SyncTimeout,

    #[error("empty authentication secret")]
    EmptyAuth,

    #[error("emergency queue is full")]
    EmergencyListOverflow,

    #[error("operation timed out")]
    Timeout,

    #[error("write timed out")]
    WriteTimeout,

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxerError>;
