//! # cadence-pacing
//!
//! Send-side RTP pacing. Producers enqueue serialized packets from any
//! thread; a single driver thread calls [`pacer::PacedSender::process`] on a
//! fixed tick, and the pacer releases packets to the transport at the target
//! rate — strictly by priority class, byte-fair between streams of the same
//! class.
//!
//! The crate does no I/O and owns no clocks: every entry point takes `now`,
//! timers and sockets are the caller's concern.
//!
//! ## Crate structure
//!
//! - [`queue`] — Round-robin packet queue: per-SSRC streams, priority
//!   schedule, two-phase pop
//! - [`budget`] — Leaky-bucket byte budgets for media and padding
//! - [`prober`] — Bandwidth probe clusters
//! - [`pacer`] — The periodic driver tying the above together
//! - [`config`] — TOML-deserializable pacer options
//! - [`stats`] — Serializable counters

pub mod budget;
pub mod config;
pub mod pacer;
pub mod prober;
pub mod queue;
pub mod stats;
