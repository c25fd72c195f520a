//! Centralized sandbox limits and configuration constants.
//!
//! All magic numbers that control sandbox behavior are collected here
//! for easy tuning.

// ===== Stack =====

/// Default capacity of the host exchange stack (number of slots).
/// Matches Lua 5.4's LUAI_MAXSTACK.
pub const LUAI_MAXSTACK: usize = 1_000_000;

// ===== Budget =====

/// VM instructions executed between two step checkpoints.
pub const DEFAULT_CHECKPOINT_INTERVAL: u32 = 1000;

/// Memory cap of [`SandboxOption::restricted`](super::SandboxOption::restricted).
pub const RESTRICTED_MEMORY_LIMIT: usize = 10 * 1024 * 1024;

/// Step cap of [`SandboxOption::restricted`](super::SandboxOption::restricted).
pub const RESTRICTED_STEP_LIMIT: u64 = 1_000_000;

// ===== Chunks =====

/// Name reported in compile and runtime messages when none is given.
pub const DEFAULT_CHUNK_NAME: &str = "chunk";

/// Base functions removed from the guest environment: they load code or
/// touch the filesystem.
pub const REMOVED_BASE_FUNCTIONS: &[&str] = &["dofile", "loadfile", "load"];

// ===== Serialization =====

/// Maximum table nesting followed when converting proxies to JSON.
pub const MAX_SERIALIZE_DEPTH: usize = 64;
