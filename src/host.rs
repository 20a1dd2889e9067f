// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The host database runtime is an external collaborator: it owns process
// lifecycle, configuration variables, and process-group identity. The pool
// allocator only consumes a narrow slice of it, expressed here as a trait
// so the crate is buildable and testable without a real host process.

use std::sync::Mutex;

/// Narrow interface onto the supervising host runtime.
///
/// A real host implements this over its own configuration store and
/// process-group bookkeeping; `StandaloneHost` below is a minimal
/// in-process implementation suitable for tests and for running the
/// allocator outside of any larger runtime.
pub trait HostRuntime: Send + Sync {
    /// Identifies the process group whose members share this pool's
    /// virtual reservation and segment table. Used to namespace
    /// shared-memory object names.
    fn process_group_id(&self) -> u32;

    /// Short name used as the first naming component of shared-memory
    /// objects, e.g. a database cluster name.
    fn pg_name(&self) -> &str;

    /// Port or other per-instance discriminator, the second naming
    /// component of shared-memory objects.
    fn instance_port(&self) -> u16;

    /// Read an integer-valued configuration variable, if set by the host.
    fn config_usize(&self, key: &str) -> Option<usize>;

    /// Total device memory visible to this process group, in bytes. Used
    /// to derive a default `min_dma_segment_nums` when not explicitly
    /// configured.
    fn total_device_memory_bytes(&self) -> u64;

    /// Register a callback to run once, before the supervising process
    /// exits, so residual shared-memory objects can be unlinked.
    fn register_shutdown_hook(&self, hook: Box<dyn FnOnce() + Send>);
}

/// Minimal standalone `HostRuntime`, backed by an in-process config map.
/// Useful for unit tests and for embedding the allocator in a process
/// that is not itself a full database host.
pub struct StandaloneHost {
    process_group_id: u32,
    pg_name: String,
    instance_port: u16,
    config: Mutex<std::collections::HashMap<String, usize>>,
    total_device_memory_bytes: u64,
    shutdown_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl StandaloneHost {
    pub fn new(pg_name: impl Into<String>, instance_port: u16) -> Self {
        Self {
            process_group_id: std::process::id(),
            pg_name: pg_name.into(),
            instance_port,
            config: Mutex::new(std::collections::HashMap::new()),
            total_device_memory_bytes: 0,
            shutdown_hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, key: &str, value: usize) -> Self {
        self.config.lock().unwrap().insert(key.to_string(), value);
        self
    }

    pub fn with_total_device_memory_bytes(mut self, bytes: u64) -> Self {
        self.total_device_memory_bytes = bytes;
        self
    }

    /// Run every registered shutdown hook, in registration order.
    pub fn run_shutdown_hooks(&self) {
        let hooks = std::mem::take(&mut *self.shutdown_hooks.lock().unwrap());
        for hook in hooks {
            hook();
        }
    }
}

impl HostRuntime for StandaloneHost {
    fn process_group_id(&self) -> u32 {
        self.process_group_id
    }

    fn pg_name(&self) -> &str {
        &self.pg_name
    }

    fn instance_port(&self) -> u16 {
        self.instance_port
    }

    fn config_usize(&self, key: &str) -> Option<usize> {
        self.config.lock().unwrap().get(key).copied()
    }

    fn total_device_memory_bytes(&self) -> u64 {
        self.total_device_memory_bytes
    }

    fn register_shutdown_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        self.shutdown_hooks.lock().unwrap().push(hook);
    }
}
