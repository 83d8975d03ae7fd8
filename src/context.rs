//! Per-reconciliation scratch space shared by dependents
//!
//! A fresh [`ReconcileContext`] is created for every dispatch attempt and
//! dropped when the attempt ends. Values are keyed by their type; writing the
//! same type twice replaces the earlier value. Writing each type once is the
//! caller's responsibility.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Retry state of the attempt that owns a context
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryInfo {
    /// 1-based count of consecutive failed attempts preceding this one (0 on a clean run)
    pub attempt: u32,
    /// True when the scheduler will not retry this identity again on failure
    pub last_attempt: bool,
}

impl RetryInfo {
    /// Whether this attempt is a retry of an earlier failure
    pub fn is_retry(&self) -> bool {
        self.attempt > 0
    }
}

type Slot = Arc<dyn Any + Send + Sync>;

/// Typed key-value map scoped to one reconciliation attempt
#[derive(Default)]
pub struct ReconcileContext {
    values: RwLock<HashMap<TypeId, Slot>>,
    retry: RetryInfo,
}

impl ReconcileContext {
    /// Create an empty context for a first attempt
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty context carrying the scheduler's retry state
    pub fn with_retry(retry: RetryInfo) -> Self {
        Self {
            values: RwLock::default(),
            retry,
        }
    }

    /// Retry state of the current attempt
    pub fn retry_info(&self) -> RetryInfo {
        self.retry
    }

    /// Store a value under its type, returning the value it replaced
    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Option<Arc<T>> {
        self.values
            .write()
            .insert(TypeId::of::<T>(), Arc::new(value))
            .and_then(|old| old.downcast::<T>().ok())
    }

    /// Fetch the value stored under `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .read()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|slot| slot.downcast::<T>().ok())
    }

    /// Whether a value of type `T` has been stored
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.read().contains_key(&TypeId::of::<T>())
    }

    /// Fetch the value under `T`, computing and storing it on first use
    pub fn get_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get::<T>() {
            return existing;
        }
        let value = Arc::new(init());
        let mut values = self.values.write();
        if let Some(raced) = values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|slot| slot.downcast::<T>().ok())
        {
            return raced;
        }
        values.insert(TypeId::of::<T>(), value.clone());
        value
    }

    /// Number of stored values
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl std::fmt::Debug for ReconcileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileContext")
            .field("values", &self.len())
            .field("retry", &self.retry)
            .finish()
    }
}
