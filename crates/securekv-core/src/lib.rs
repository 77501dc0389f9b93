//! Core abstractions for securekv: the secure store contract, the operation
//! executor written against it, and the method-call facade in front of both.
//! Backends live in `securekv-storage`; this crate stays free of OS bindings.

pub mod dispatch;
pub mod storage;
