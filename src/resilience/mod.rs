//! Retry timing shared by background loops.

pub mod backoff;
