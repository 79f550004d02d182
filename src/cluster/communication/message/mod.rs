//! This module contains types associated with messages traded
//! between the cluster processes.

use std::error;
use std::fmt;
use std::mem::MaybeUninit;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

use crate::cluster::communication::WorkerId;
use crate::cluster::error::*;
use crate::cluster::topology::Topology;

/// Identifies a remote value somewhere in the cluster.
///
/// `whence` is the id of the worker that minted the reference, `id` a
/// per-worker monotonic counter, and `tag` disambiguates multiple
/// references minted by a single call site. The null reference,
/// `Rrid::NULL`, denotes that no value is expected at this address.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(C)]
pub struct Rrid {
    pub(crate) id: u64,
    pub(crate) whence: u32,
    pub(crate) tag: u32,
}

impl Rrid {
    /// The null reference; no value is expected at this address.
    pub const NULL: Rrid = Rrid {
        id: 0,
        whence: 0,
        tag: 0,
    };

    /// Creates a new reference id.
    pub fn new(whence: WorkerId, id: u64, tag: u32) -> Self {
        Rrid {
            id,
            whence: whence.into(),
            tag,
        }
    }

    /// Checks whether this is the null reference.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Returns the id of the worker that minted this reference.
    pub fn whence(&self) -> WorkerId {
        WorkerId::from(self.whence)
    }
}

/// A header that is sent before a message in transit in the wire.
///
/// A fixed amount of `Header::LENGTH` bytes are read before
/// a message is read. Contains the two reference ids correlating
/// requests with replies, the body length, as well as other metadata.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C)]
pub struct Header {
    // length of the message body
    pub(crate) length: u64,
    // where the producer stores the result
    pub(crate) response_oid: Rrid,
    // where the initiator awaits the result
    pub(crate) notify_oid: Rrid,
    // origin of the message
    pub(crate) from: u32,
    // the advisory protocol version
    pub(crate) version: u32,
}

/// A message to be sent over the wire: a `Header`, a self-delimited
/// body produced by the configured codec, and the frame boundary.
#[derive(Debug)]
pub struct WireMessage<'a> {
    pub(crate) header: Header,
    pub(crate) body: &'a [u8],
}

/// The messages understood by the per-peer dispatcher.
///
/// The `O` type argument is the user operation evaluated by a worker's
/// service, while `V` is the value such an evaluation produces.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum SystemMessage<O, V> {
    /// Execute a thunk, binding its outcome to `response_oid`.
    /// The submitter expects no immediate reply.
    Call(Thunk<O, V>),
    /// Execute a thunk, delivering its value to `notify_oid`.
    CallFetch(Thunk<O, V>),
    /// Execute a thunk, acknowledging mere completion to `notify_oid`.
    CallWait(Thunk<O, V>),
    /// Fire-and-forget execution; failures are only logged.
    RemoteDo(Thunk<O, V>),
    /// Carries a value to be stored at `response_oid`.
    Result(Answer<V>),
    /// First message on a fresh worker-to-worker stream,
    /// naming the initiating peer.
    IdentifySocket { from: WorkerId },
    /// Acknowledges `IdentifySocket`, carrying the accepting
    /// peer's advisory version.
    IdentifySocketAck { version: String },
    /// Controller to fresh worker: adopt an id and join the group.
    JoinPgrp(JoinGroup),
    /// Fresh worker to controller: the join has completed.
    JoinComplete { cpu_threads: u32, ospid: u32 },
}

/// The work transported by a call message.
///
/// Closures cannot cross the wire, so calls either apply a user
/// operation through the receiving worker's service, or run one of the
/// built-in registry operations the `Future` verbs compile into.
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum Thunk<O, V> {
    /// Evaluate a user operation.
    Apply(O),
    /// Clone the value bound to a reference owned by the receiver.
    FetchRef(Rrid),
    /// Consume the value bound to a reference owned by the receiver.
    TakeRef(Rrid),
    /// Store a value into a reference owned by the receiver.
    PutRef(Rrid, V),
    /// Register a new holder of a reference owned by the receiver.
    AddClient(Rrid, WorkerId),
    /// Drop holders of references owned by the receiver.
    DelClients(Vec<(Rrid, WorkerId)>),
    /// Remove a worker from the cluster; only honored by the controller.
    Remove(WorkerId),
    /// Orderly shutdown of the receiving worker.
    Exit,
}

/// What lands in the slot of a remote value.
#[derive(Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub enum Answer<V> {
    /// Completion acknowledgement; carries no value.
    Done,
    /// A value produced by a thunk.
    Value(V),
    /// The id of a worker that finished joining the cluster.
    Joined(WorkerId),
    /// An error captured on a remote worker.
    Exception(RemoteException),
}

impl<V> Answer<V> {
    /// Checks whether this answer carries a remote exception.
    pub fn is_exception(&self) -> bool {
        matches!(self, Answer::Exception(_))
    }
}

impl<V> fmt::Debug for Answer<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Answer::Done => write!(f, "Done"),
            Answer::Value(_) => write!(f, "Value(..)"),
            Answer::Joined(wid) => write!(f, "Joined({})", wid),
            Answer::Exception(e) => write!(f, "Exception({})", e),
        }
    }
}

/// The payload sent in place of a value when evaluation fails on a
/// remote worker. This is the only error that crosses the wire.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct RemoteException {
    pid: WorkerId,
    cause: CapturedError,
}

/// An error captured at its point of origin, decoupled from the
/// concrete error type that produced it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct CapturedError {
    kind: ErrorKind,
    message: String,
    backtrace: Option<String>,
}

/// The parameters a fresh worker needs to join the group.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct JoinGroup {
    /// The id the fresh worker shall adopt.
    pub self_pid: WorkerId,
    /// The other members of the cluster, along with the addresses
    /// at which they accept connections.
    pub other_workers: Vec<(WorkerId, String)>,
    /// The connectivity pattern of the cluster.
    pub topology: Topology,
    /// Defer worker-to-worker connections to first use.
    pub lazy: bool,
    /// Advisory knob for math kernels on the worker.
    pub enable_threaded_blas: bool,
}

impl RemoteException {
    /// Creates a new `RemoteException`, captured on worker `pid`.
    pub fn new(pid: WorkerId, cause: CapturedError) -> Self {
        Self { pid, cause }
    }

    /// Returns the id of the worker the exception was captured on.
    pub fn pid(&self) -> WorkerId {
        self.pid
    }

    /// Returns the captured cause of this exception.
    pub fn cause(&self) -> &CapturedError {
        &self.cause
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "on worker {}: {}", self.pid, self.cause)
    }
}

impl error::Error for RemoteException {}

impl CapturedError {
    /// Captures an error as a kind and a rendered message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            backtrace: None,
        }
    }

    /// Attaches a rendered backtrace to the captured error.
    pub fn with_backtrace(mut self, backtrace: String) -> Self {
        self.backtrace = Some(backtrace);
        self
    }

    /// Returns the kind of the captured error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the rendered message of the captured error.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the backtrace captured alongside the error, if any.
    pub fn backtrace(&self) -> Option<&str> {
        self.backtrace.as_deref()
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// FIXME: perhaps use references for serializing and deserializing,
// to save a stack allocation? probably overkill
impl Header {
    /// The size of the memory representation of the `Header` in bytes.
    pub const LENGTH: usize = std::mem::size_of::<Self>();

    unsafe fn serialize_into_unchecked(self, buf: &mut [u8]) {
        // the wire representation is little endian
        #[cfg(target_endian = "big")]
        let this = {
            let mut this = self;
            this.length = this.length.to_le();
            this.response_oid.id = this.response_oid.id.to_le();
            this.response_oid.whence = this.response_oid.whence.to_le();
            this.response_oid.tag = this.response_oid.tag.to_le();
            this.notify_oid.id = this.notify_oid.id.to_le();
            this.notify_oid.whence = this.notify_oid.whence.to_le();
            this.notify_oid.tag = this.notify_oid.tag.to_le();
            this.from = this.from.to_le();
            this.version = this.version.to_le();
            this
        };
        #[cfg(target_endian = "little")]
        let this = self;
        let hdr: [u8; Self::LENGTH] = std::mem::transmute(this);
        (&mut buf[..Self::LENGTH]).copy_from_slice(&hdr[..]);
    }

    /// Serialize a `Header` into a byte buffer of appropriate size.
    pub fn serialize_into(self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to serialize into")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { self.serialize_into_unchecked(buf) })
    }

    unsafe fn deserialize_from_unchecked(buf: &[u8]) -> Self {
        let mut raw: [u8; Self::LENGTH] = {
            let raw = MaybeUninit::uninit();
            raw.assume_init()
        };
        (&mut raw[..]).copy_from_slice(&buf[..Self::LENGTH]);
        #[cfg(target_endian = "big")]
        let hdr = {
            let mut hdr: Self = std::mem::transmute(raw);
            hdr.length = hdr.length.to_be();
            hdr.response_oid.id = hdr.response_oid.id.to_be();
            hdr.response_oid.whence = hdr.response_oid.whence.to_be();
            hdr.response_oid.tag = hdr.response_oid.tag.to_be();
            hdr.notify_oid.id = hdr.notify_oid.id.to_be();
            hdr.notify_oid.whence = hdr.notify_oid.whence.to_be();
            hdr.notify_oid.tag = hdr.notify_oid.tag.to_be();
            hdr.from = hdr.from.to_be();
            hdr.version = hdr.version.to_be();
            hdr
        };
        #[cfg(target_endian = "little")]
        let hdr: Self = std::mem::transmute(raw);
        hdr
    }

    /// Deserialize a `Header` from a byte buffer of appropriate size.
    pub fn deserialize_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LENGTH {
            return Err("Buffer is too short to deserialize from")
                .wrapped(ErrorKind::CommunicationMessage);
        }
        Ok(unsafe { Self::deserialize_from_unchecked(buf) })
    }

    /// Returns the length of the message body following this header.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Returns the reference the producer binds its result to.
    pub fn response_oid(&self) -> Rrid {
        self.response_oid
    }

    /// Returns the reference the initiator awaits the result on.
    pub fn notify_oid(&self) -> Rrid {
        self.notify_oid
    }

    /// Returns the id of the worker that emitted this message.
    pub fn from(&self) -> WorkerId {
        WorkerId::from(self.from)
    }

    /// Reports the version of the wire protocol used by the sender,
    /// i.e. `WireMessage::CURRENT_VERSION` on this build.
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl<'a> WireMessage<'a> {
    /// The current version of the wire protocol.
    pub const CURRENT_VERSION: u32 = 0;

    /// Constructs a new message to be sent over the wire.
    pub fn new(from: WorkerId, response_oid: Rrid, notify_oid: Rrid, body: &'a [u8]) -> Self {
        let header = Header {
            length: body.len() as u64,
            response_oid,
            notify_oid,
            from: from.into(),
            version: Self::CURRENT_VERSION,
        };
        Self { header, body }
    }

    /// Retrieve the inner `Header` and body byte buffer stored
    /// inside the `WireMessage`.
    pub fn into_inner(self) -> (Header, &'a [u8]) {
        (self.header, self.body)
    }

    /// Returns a reference to the `Header` of the `WireMessage`.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns a reference to the body bytes of the `WireMessage`.
    pub fn body(&self) -> &'a [u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use crate::cluster::communication::message::{Header, Rrid, WireMessage};
    use crate::cluster::communication::WorkerId;

    #[test]
    fn test_header_serialize() {
        let response = Rrid::new(WorkerId::from(1u32), 77, 1);
        let notify = Rrid::new(WorkerId::from(1u32), 77, 2);
        let (old_header, _) = WireMessage::new(
            WorkerId::from(1u32),
            response,
            notify,
            b"I am a cool payload!",
        )
        .into_inner();
        let mut buf = [0; Header::LENGTH];
        old_header
            .serialize_into(&mut buf[..])
            .expect("Serialize failed");
        let new_header = Header::deserialize_from(&buf[..]).expect("Deserialize failed");
        assert_eq!(old_header, new_header);
        assert_eq!(new_header.length(), 20);
        assert_eq!(new_header.response_oid(), response);
        assert_eq!(new_header.notify_oid(), notify);
    }

    #[test]
    fn test_null_rrid() {
        assert!(Rrid::NULL.is_null());
        assert!(!Rrid::new(WorkerId::from(1u32), 1, 0).is_null());
    }
}
