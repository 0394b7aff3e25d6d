// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for filesystem instances

use serde::{Deserialize, Serialize};

/// Configuration for an in-memory node-tree filesystem instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TreeFsConfig {
    /// Capacity in bytes of the queue backing each named pipe.
    pub pipe_capacity: usize,
    /// Upper bound on simultaneously open file and directory handles.
    pub max_open_handles: usize,
}

impl Default for TreeFsConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 128,
            max_open_handles: 256,
        }
    }
}
