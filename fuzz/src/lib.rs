//! Fuzzing harnesses for the vfb primitives.
//!
//! These fuzzers drive in-memory models of the shared structures, without
//! touching real shm, to check the invariants of the robust lock protocol,
//! the generational semaphore and the frame slot.

pub mod lock_model;
pub mod pixbuf_model;
pub mod sem_model;
