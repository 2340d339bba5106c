// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient lock helpers.
//!
//! Lock poisoning occurs when a thread panics while holding a lock. For the
//! token store and the sanitizer's rate-limit map, stale data is preferable
//! to a denial of service, so these helpers log a security event and recover
//! the guard instead of propagating the panic.

use std::sync::{Mutex, MutexGuard};

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// If the lock is poisoned, logs a CRITICAL event and returns the guard
/// anyway; the protected data may be stale.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "security::locks",
                event = "LOCK_POISONED",
                "CRITICAL: Mutex was poisoned during acquisition. Recovering data. \
                 A thread previously panicked while holding this lock. \
                 Data may be inconsistent. Investigate panic cause in logs."
            );
            poisoned.into_inner()
        }
    }
}
