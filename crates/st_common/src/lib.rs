#![warn(missing_docs)]
#![deny(clippy::disallowed_types, clippy::await_holding_lock)]
#![allow(clippy::type_complexity)]

//! The Strata runtime: the section cache, the storage adaptor chain and the background services
//! keeping the level-of-detail pyramid persisted.

pub mod concurrency;
pub mod config;
pub mod id_alloc;
pub mod prelude;
pub mod storage;
pub mod thread;
pub mod world;
