//! # coven
//!
//! A runtime for clusters of cooperating worker processes. A cluster is
//! formed by a controller process (worker id 1) and any number of worker
//! processes (ids 2 and up), connected by long-lived duplex byte streams
//! over which remote procedure calls are multiplexed.
//!
//! The building blocks live in the [`cluster`] module: the wire protocol
//! and per-peer dispatcher, the registry of remote values, the worker
//! directory, the join protocol, and the supervision logic that reacts to
//! peer failure.

pub mod cluster;
