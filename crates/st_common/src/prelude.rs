//! Common type aliases

// some of the imports here are not used yet, but are pre-defined for symmetry
#![allow(unused)]

// Anyhow error handling
pub use anyhow::{anyhow, bail, ensure, Context, Result};

// std MPSC channels
pub use std::sync::mpsc::{
    channel as std_unbounded_channel, sync_channel as std_bounded_channel, Receiver as StdUnboundedReceiver,
    Sender as StdUnboundedSender, SyncSender as StdBoundedSender,
};

// Common synchronization/cell types
pub use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock, RwLock, Weak};
pub use std::cell::{Cell, OnceCell, RefCell};
pub use std::sync::atomic::{Ordering as AtomicOrdering, *};

// hashbrown Hash* types
pub use hashbrown::{HashMap, HashSet};

// Shared-pointer swapping
pub use arc_swap::{ArcSwap, ArcSwapOption};

// Schema types used everywhere
pub use st_schemas::coordinates::SectionKey;
