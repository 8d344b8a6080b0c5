//! The response pipeline itself: receiver (C3), filter/forwarder (C4),
//! and sender (C5) from spec.md §4. Split into one module per
//! component, matching the module map in `SPEC_FULL.md` §F.4.

pub mod filter;
pub mod receiver;
pub mod sender;
