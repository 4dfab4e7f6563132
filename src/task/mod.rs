// ============================================================================
// src/task/mod.rs - Thread and Team Identity
// ============================================================================

pub mod thread;

pub use thread::{
    IDLE_PRIORITY, MAX_PRIORITY, NORMAL_PRIORITY, TeamId, ThreadId, ThreadRegistry, ThreadTable,
};
