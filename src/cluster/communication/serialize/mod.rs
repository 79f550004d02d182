//! This module is responsible for the serialization of messages
//! crossing the wire.
//!
//! The body codec is supplied by the user of the library: the core only
//! requires that encoded bodies are self-delimited, so a decoder can
//! consume exactly one message from a byte stream. Implementations
//! typically derive serde on their payload types and delegate to a
//! format crate such as `bincode`.

use std::io::{Read, Write};

use crate::cluster::communication::message::SystemMessage;
use crate::cluster::error::*;

/// Marries the user payload types of a cluster with their
/// serialization routines.
///
/// A mis-encoded or truncated body must surface as an `Err` from
/// `deserialize_message`; the dispatcher recovers from such faults by
/// scanning for the next frame boundary.
pub trait ClusterData: Send + Sync + 'static {
    /// The operation evaluated by the service running on a worker.
    type Operation: Send + Sync + 'static;

    /// The value produced by evaluating an operation.
    type Value: Send + Sync + Clone + 'static;

    /// Serialize one complete message body into the given writer.
    fn serialize_message<W>(w: W, m: &SystemMessage<Self::Operation, Self::Value>) -> Result<()>
    where
        W: Write;

    /// Deserialize one complete message body from the given reader.
    fn deserialize_message<R>(r: R) -> Result<SystemMessage<Self::Operation, Self::Value>>
    where
        R: Read;
}
