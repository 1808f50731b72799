use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the guard if a panicking test poisoned it.
/// Engine state stays internally consistent because every critical section
/// is a handful of map operations with no early exits.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
