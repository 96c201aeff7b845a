use crate::error::Result;
use crate::model::Id;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};

/// Resolves an id into a shared instance on first dereference
pub type Resolver<T> = Arc<dyn Fn(&Id) -> Result<Option<Arc<T>>> + Send + Sync>;

enum Slot<T> {
    Unresolved,
    Resolved(Weak<T>),
}

/// Handle for an object known only by id until first access.
///
/// The resolved value is memoised as a weak pointer: whoever owns the graph
/// (the build scope) keeps objects alive, so handles pointing back up a
/// reference cycle never form `Arc` cycles. If the target has been dropped
/// in the meantime the resolver runs again.
pub struct LazyRef<T> {
    id: Id,
    slot: RwLock<Slot<T>>,
    resolver: Option<Resolver<T>>,
}

impl<T> LazyRef<T> {
    pub fn new(id: Id, resolver: Resolver<T>) -> Self {
        Self {
            id,
            slot: RwLock::new(Slot::Unresolved),
            resolver: Some(resolver),
        }
    }

    /// A handle already pointing at `value`; it cannot re-resolve.
    pub fn resolved(id: Id, value: &Arc<T>) -> Self {
        Self {
            id,
            slot: RwLock::new(Slot::Resolved(Arc::downgrade(value))),
            resolver: None,
        }
    }

    /// A handle with no way to resolve; dereferencing yields `None`.
    pub fn detached(id: Id) -> Self {
        Self {
            id,
            slot: RwLock::new(Slot::Unresolved),
            resolver: None,
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        match &*self.slot.read() {
            Slot::Resolved(weak) => weak.strong_count() > 0,
            Slot::Unresolved => false,
        }
    }

    /// Dereference the handle, resolving it if needed
    pub fn get(&self) -> Result<Option<Arc<T>>> {
        if let Slot::Resolved(weak) = &*self.slot.read() {
            if let Some(value) = weak.upgrade() {
                return Ok(Some(value));
            }
        }

        let Some(resolver) = &self.resolver else {
            return Ok(None);
        };

        let resolved = resolver(&self.id)?;
        if let Some(value) = &resolved {
            *self.slot.write() = Slot::Resolved(Arc::downgrade(value));
        }
        Ok(resolved)
    }
}

impl<T> fmt::Debug for LazyRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRef")
            .field("id", &self.id)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::generate_id;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_resolver_runs_once_while_target_alive() {
        let target = Arc::new("home".to_string());
        let calls = Arc::new(AtomicUsize::new(0));

        let held = target.clone();
        let counter = calls.clone();
        let handle: LazyRef<String> = LazyRef::new(
            generate_id(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(held.clone()))
            }),
        );

        assert!(!handle.is_resolved());
        let first = handle.get().unwrap().unwrap();
        let second = handle.get().unwrap().unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &target));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_resolved());
    }

    #[test]
    fn test_dropped_target_is_resolved_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle: LazyRef<String> = LazyRef::new(
            generate_id(),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Some(Arc::new("fresh".to_string())))
            }),
        );

        // Nobody keeps the first instance alive
        drop(handle.get().unwrap());
        let again = handle.get().unwrap();

        assert_eq!(again.as_deref().map(String::as_str), Some("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_detached_handle_yields_nothing() {
        let handle: LazyRef<String> = LazyRef::detached(generate_id());
        assert!(handle.get().unwrap().is_none());
    }
}
