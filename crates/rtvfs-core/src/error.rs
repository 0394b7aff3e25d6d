// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types shared by the VFS core, filesystems and device drivers

use std::io;

/// Filesystem and driver status codes.
///
/// The dispatch core forwards these verbatim from the filesystem or driver
/// that produced them; it never rewrites a status on the way up.
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("name not allowed")]
    InvalidName,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("busy")]
    Busy,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("no space left")]
    NoSpace,
    #[error("no such device")]
    NoDevice,
    #[error("resource temporarily unavailable")]
    TryAgain,
    #[error("read-only file system")]
    ReadOnly,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("timed out")]
    TimedOut,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unsupported")]
    Unsupported,
}

pub type FsResult<T> = Result<T, FsError>;
