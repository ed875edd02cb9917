// MIT License - Copyright (c) 2026 Peter Wright
// Socket-facing layers: framing, reply correlation, session context

pub mod codec;
pub mod correlator;
pub(crate) mod session;
