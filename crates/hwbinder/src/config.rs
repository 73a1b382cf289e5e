//! Runtime configuration

use hidl_wire::{DecodeLimits, DEFAULT_MAX_OBJECTS, DEFAULT_MAX_WIRE_SIZE};

/// Binder process configuration
#[derive(Debug, Clone)]
pub struct BinderConfig {
    /// Worker threads serving incoming transactions, including a caller
    /// that joins the pool
    pub max_threads: usize,
    /// Whether the thread that starts the pool also serves transactions
    pub caller_joins: bool,
    /// Largest encoded transaction accepted on receipt
    pub max_wire_size: usize,
    /// Largest object table accepted on receipt
    pub max_objects: usize,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            max_threads: 1,
            caller_joins: false,
            max_wire_size: DEFAULT_MAX_WIRE_SIZE,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }
}

impl BinderConfig {
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    pub fn with_caller_joins(mut self, caller_joins: bool) -> Self {
        self.caller_joins = caller_joins;
        self
    }

    pub fn with_max_wire_size(mut self, max_wire_size: usize) -> Self {
        self.max_wire_size = max_wire_size;
        self
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    /// Threads the pool spawns itself
    pub fn spawned_threads(&self) -> usize {
        if self.caller_joins {
            self.max_threads.saturating_sub(1)
        } else {
            self.max_threads
        }
    }

    /// Limits applied when decoding received transactions
    pub fn decode_limits(&self) -> DecodeLimits {
        DecodeLimits {
            max_size: self.max_wire_size,
            max_objects: self.max_objects,
        }
    }
}
