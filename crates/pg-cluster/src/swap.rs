//! Copy-on-publish snapshot cell.
//!
//! Readers take a cheap reference-counted handle to the current value and
//! keep using it for as long as they like. Writers build a complete new
//! value off to the side and publish it with a single pointer swap, so a
//! reader never observes a partially updated value.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

/// Atomically swappable immutable snapshot.
pub struct SharedCell<T> {
    current: RwLock<Arc<T>>,
    // Serializes writers so read-modify-write cycles never lose updates.
    write_lock: Mutex<()>,
}

impl<T> SharedCell<T> {
    /// Create a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
            write_lock: Mutex::new(()),
        }
    }

    /// Get the current snapshot.
    ///
    /// The read lock is held only long enough to clone the `Arc`.
    pub fn read(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Replace the snapshot unconditionally.
    pub fn store(&self, value: T) {
        let _writer = self.write_lock.lock();
        self.publish(Arc::new(value));
    }

    fn publish(&self, value: Arc<T>) -> Arc<T> {
        std::mem::replace(&mut *self.current.write(), value)
    }
}

impl<T: Clone> SharedCell<T> {
    /// Start a read-modify-write cycle.
    ///
    /// The returned writer holds a private copy of the current value. Nothing
    /// becomes visible to readers until [`SharedCellWriter::commit`] is
    /// called; dropping the writer discards the copy.
    pub fn start_write(&self) -> SharedCellWriter<'_, T> {
        let guard = self.write_lock.lock();
        let value = T::clone(&self.read());
        SharedCellWriter {
            cell: self,
            value,
            _guard: guard,
        }
    }
}

impl<T: Default> Default for SharedCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedCell").field(&*self.read()).finish()
    }
}

/// Pending update of a [`SharedCell`].
pub struct SharedCellWriter<'a, T> {
    cell: &'a SharedCell<T>,
    value: T,
    _guard: MutexGuard<'a, ()>,
}

impl<T> SharedCellWriter<'_, T> {
    /// Publish the modified value.
    pub fn commit(self) {
        self.cell.publish(Arc::new(self.value));
    }
}

impl<T> std::ops::Deref for SharedCellWriter<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for SharedCellWriter<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}
