//! Task and operation ID generation.
//!
//! IDs are random UUID v4 strings. Tests can switch to a deterministic
//! counter so IDs (and therefore fixtures) are predictable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Global counter for deterministic ID generation in tests.
static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Whether to use deterministic IDs (for testing).
static USE_DETERMINISTIC_IDS: AtomicBool = AtomicBool::new(false);

/// Enable deterministic ID generation for testing.
///
/// When enabled, IDs will use a counter instead of a random UUID.
pub fn enable_deterministic_ids() {
    USE_DETERMINISTIC_IDS.store(true, Ordering::SeqCst);
    TEST_COUNTER.store(0, Ordering::SeqCst);
}

/// Disable deterministic ID generation.
pub fn disable_deterministic_ids() {
    USE_DETERMINISTIC_IDS.store(false, Ordering::SeqCst);
}

fn generate_with_prefix(prefix: &str) -> String {
    if USE_DETERMINISTIC_IDS.load(Ordering::SeqCst) {
        let count = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{count:04x}")
    } else {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Generate a new task ID.
#[must_use]
pub fn generate_task_id() -> String {
    generate_with_prefix("task")
}

/// Generate a new offline operation ID.
#[must_use]
pub fn generate_operation_id() -> String {
    generate_with_prefix("op")
}
