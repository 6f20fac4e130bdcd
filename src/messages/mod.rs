//! Wire-level message codes, framing and payload layouts.

pub mod backend;
pub mod frontend;
