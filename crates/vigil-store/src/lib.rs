//! vigil-store — Storage substrate for the identity engine.
//!
//! A lock coordinator with bounded waiter preemption, capacity-bounded entry
//! containers with least-recently-updated eviction, a JSON snapshot store built
//! on top of them, and a write-through filesystem blob cache.

pub mod clock;
pub mod container;
pub mod lock;
pub mod persistence;
pub mod storage;

pub use container::{BoundedContainer, ContainerError, Entry, EntryMeta, MapContainer, Record};
pub use lock::{LockCoordinator, LockError, LockKey};
pub use persistence::JsonFilePersistence;
pub use storage::{FsStorage, PendingWrite, StorageError};
