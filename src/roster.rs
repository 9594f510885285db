//! Process-wide roster of live channel locks.
//!
//! The shutdown coordinator walks this roster to release every held lock
//! within its grace window. Entries are weak so a destroyed lock can never
//! be kept alive by the roster itself.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::lock::Lock;

static ROSTER: OnceLock<Mutex<Vec<Weak<dyn Lock>>>> = OnceLock::new();

fn roster() -> &'static Mutex<Vec<Weak<dyn Lock>>> {
    ROSTER.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a lock; re-registration of the same instance is a no-op
pub fn register(lock: &Arc<dyn Lock>) {
    let mut entries = roster().lock().unwrap();
    let weak = Arc::downgrade(lock);
    if !entries.iter().any(|w| Weak::ptr_eq(w, &weak)) {
        entries.push(weak);
    }
}

/// Remove a lock from the roster
pub fn deregister(lock: &Arc<dyn Lock>) {
    let weak = Arc::downgrade(lock);
    roster()
        .lock()
        .unwrap()
        .retain(|w| !Weak::ptr_eq(w, &weak) && w.strong_count() > 0);
}

/// Snapshot of all still-live locks, pruning dead entries
pub fn live() -> Vec<Arc<dyn Lock>> {
    let mut entries = roster().lock().unwrap();
    entries.retain(|w| w.strong_count() > 0);
    entries.iter().filter_map(Weak::upgrade).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopLock;

    fn contains(lock: &Arc<dyn Lock>) -> bool {
        live().iter().any(|l| Arc::ptr_eq(l, lock))
    }

    #[test]
    fn test_register_and_deregister() {
        let lock: Arc<dyn Lock> = Arc::new(NoopLock::new("roster_test_a"));

        register(&lock);
        assert!(contains(&lock));

        deregister(&lock);
        assert!(!contains(&lock));
    }

    #[test]
    fn test_register_is_deduplicated() {
        let lock: Arc<dyn Lock> = Arc::new(NoopLock::new("roster_test_b"));

        register(&lock);
        register(&lock);

        let matches = live().iter().filter(|l| Arc::ptr_eq(l, &lock)).count();
        assert_eq!(matches, 1);

        deregister(&lock);
    }

    #[test]
    fn test_dropped_locks_are_pruned() {
        let lock: Arc<dyn Lock> = Arc::new(NoopLock::new("roster_test_c"));
        register(&lock);
        drop(lock);

        // A dropped lock never comes back from the snapshot.
        assert!(live()
            .iter()
            .all(|l| l.channel() != "roster_test_c"));
    }
}
