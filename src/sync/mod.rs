//! Synchronization primitives shared across the client
//!
//! This module provides the two low-level building blocks the link is built
//! on: a mutex wrapper that bounds how long an acquisition may silently wait
//! ([`timed_lock`]) and a single-slot wait/signal rendezvous ([`signal`]).

pub mod signal;
pub mod timed_lock;

pub use signal::Signal;
pub use timed_lock::{lock_timeout, set_lock_timeout, TimedMutex, DEFAULT_LOCK_TIMEOUT};
