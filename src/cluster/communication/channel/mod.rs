//! Rendezvous and channel primitives used by the communication layer.
//!
//! `Slot` is the single-value rendezvous behind every remote value,
//! `Event` the one-shot condition workers signal once their handshake
//! completes, and `Semaphore` bounds concurrency (parallel launches,
//! synchronized takes). `MessageChannelTx`/`MessageChannelRx` wrap the
//! configured bounded channel implementation.

use std::collections::VecDeque;
use std::sync::Arc;

use either::{Either, Left, Right};
use parking_lot::Mutex;

use crate::cluster::error::*;

/// A single-value rendezvous cell.
///
/// A slot accepts exactly one `put` over its lifetime. Buffered slots
/// complete the put immediately; unbuffered slots block the putter until
/// a taker consumes the value. Any number of tasks may `fetch` (peek) a
/// buffered slot, while `take` consumes the value for good.
pub struct Slot<T> {
    shared: Arc<SlotShared<T>>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Slot {
            shared: self.shared.clone(),
        }
    }
}

struct SlotShared<T> {
    state: Mutex<SlotState<T>>,
}

struct SlotState<T> {
    value: Option<T>,
    // a put has been accepted at some point in time
    filled: bool,
    // the value has been taken out
    consumed: bool,
    buffered: bool,
    takers: Vec<oneshot::Sender<()>>,
    putters: Vec<oneshot::Sender<()>>,
}

impl<T> Slot<T> {
    fn with_buffering(buffered: bool) -> Self {
        Slot {
            shared: Arc::new(SlotShared {
                state: Mutex::new(SlotState {
                    value: None,
                    filled: false,
                    consumed: false,
                    buffered,
                    takers: Vec::new(),
                    putters: Vec::new(),
                }),
            }),
        }
    }

    /// Creates a slot which completes puts immediately.
    pub fn buffered() -> Self {
        Self::with_buffering(true)
    }

    /// Creates a rendezvous slot; puts block until the value is taken.
    pub fn unbuffered() -> Self {
        Self::with_buffering(false)
    }

    /// Reports whether puts against this slot complete immediately.
    pub fn is_buffered(&self) -> bool {
        self.shared.state.lock().buffered
    }

    /// Reports whether a put has ever been accepted.
    pub fn is_filled(&self) -> bool {
        self.shared.state.lock().filled
    }

    /// Reports whether the value has been taken out.
    pub fn is_consumed(&self) -> bool {
        self.shared.state.lock().consumed
    }

    /// Stores a value in the slot, waking every waiting task.
    ///
    /// At most one put per slot ever succeeds. On an unbuffered slot
    /// this suspends the caller until the value is consumed.
    pub async fn put(&self, value: T) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if state.filled {
                return Err("Slot has already been filled")
                    .wrapped(ErrorKind::CommunicationChannel);
            }
            state.filled = true;
            state.value = Some(value);
            for tx in state.takers.drain(..) {
                let _ = tx.send(());
            }
            if state.buffered {
                return Ok(());
            }
        }
        loop {
            let wait = {
                let mut state = self.shared.state.lock();
                if state.consumed {
                    return Ok(());
                }
                let (tx, rx) = oneshot::channel();
                state.putters.push(tx);
                rx
            };
            let _ = wait.await;
        }
    }

    /// Same as `put`, except the caller is never suspended; on an
    /// unbuffered slot the rendezvous with the taker is skipped.
    pub fn put_now(&self, value: T) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.filled {
            return Err("Slot has already been filled").wrapped(ErrorKind::CommunicationChannel);
        }
        state.filled = true;
        state.value = Some(value);
        for tx in state.takers.drain(..) {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Consumes the value out of the slot, suspending while it is empty.
    pub async fn take(&self) -> T {
        loop {
            let outcome = {
                let mut state = self.shared.state.lock();
                match state.value.take() {
                    Some(v) => {
                        state.consumed = true;
                        for tx in state.putters.drain(..) {
                            let _ = tx.send(());
                        }
                        Left(v)
                    }
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.takers.push(tx);
                        Right(rx)
                    }
                }
            };
            match outcome {
                Left(v) => return v,
                Right(rx) => {
                    let _ = rx.await;
                }
            }
        }
    }

    /// Clones the value out of the slot without consuming it,
    /// suspending while the slot is empty.
    pub async fn fetch(&self) -> T
    where
        T: Clone,
    {
        loop {
            let outcome: Either<T, oneshot::Receiver<()>> = {
                let mut state = self.shared.state.lock();
                match state.value.as_ref() {
                    Some(v) => Left(v.clone()),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        state.takers.push(tx);
                        Right(rx)
                    }
                }
            };
            match outcome {
                Left(v) => return v,
                Right(rx) => {
                    let _ = rx.await;
                }
            }
        }
    }

    /// Clones the value out of the slot, if one is present.
    pub fn try_fetch(&self) -> Option<T>
    where
        T: Clone,
    {
        self.shared.state.lock().value.clone()
    }
}

/// A one-shot condition other tasks may wait on.
#[derive(Clone)]
pub struct Event {
    shared: Arc<Mutex<EventState>>,
}

struct EventState {
    set: bool,
    waiting: Vec<oneshot::Sender<()>>,
}

impl Event {
    /// Creates a new, unset `Event`.
    pub fn new() -> Self {
        Event {
            shared: Arc::new(Mutex::new(EventState {
                set: false,
                waiting: Vec::new(),
            })),
        }
    }

    /// Signals the event, waking every waiting task.
    pub fn set(&self) {
        let mut state = self.shared.lock();
        state.set = true;
        for tx in state.waiting.drain(..) {
            let _ = tx.send(());
        }
    }

    /// Tests if the event has been signaled.
    pub fn is_set(&self) -> bool {
        self.shared.lock().set
    }

    /// Suspends the caller until the event is signaled.
    pub async fn wait(&self) {
        loop {
            let wait = {
                let mut state = self.shared.lock();
                if state.set {
                    return;
                }
                let (tx, rx) = oneshot::channel();
                state.waiting.push(tx);
                rx
            };
            let _ = wait.await;
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Event::new()
    }
}

/// An async counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    shared: Arc<Mutex<SemaphoreState>>,
}

struct SemaphoreState {
    permits: usize,
    waiting: VecDeque<oneshot::Sender<()>>,
}

/// Releases its permit back to the owning `Semaphore` when dropped.
pub struct SemaphoreGuard {
    shared: Arc<Mutex<SemaphoreState>>,
}

impl Semaphore {
    /// Creates a new `Semaphore` holding `permits` permits.
    pub fn new(permits: usize) -> Self {
        Semaphore {
            shared: Arc::new(Mutex::new(SemaphoreState {
                permits,
                waiting: VecDeque::new(),
            })),
        }
    }

    /// Acquires one permit, suspending the caller while none are free.
    pub async fn acquire(&self) -> SemaphoreGuard {
        loop {
            let wait = {
                let mut state = self.shared.lock();
                if state.permits > 0 {
                    state.permits -= 1;
                    return SemaphoreGuard {
                        shared: self.shared.clone(),
                    };
                }
                let (tx, rx) = oneshot::channel();
                state.waiting.push_back(tx);
                rx
            };
            let _ = wait.await;
        }
    }
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.permits += 1;
        while let Some(tx) = state.waiting.pop_front() {
            // wake the next waiter still interested in a permit
            if tx.send(()).is_ok() {
                break;
            }
        }
    }
}

/// Sending half of the bounded channel carrying cluster events.
pub struct MessageChannelTx<T> {
    inner: imp::Tx<T>,
}

/// Receiving half of the bounded channel carrying cluster events.
pub struct MessageChannelRx<T> {
    inner: imp::Rx<T>,
}

impl<T> Clone for MessageChannelTx<T> {
    fn clone(&self) -> Self {
        MessageChannelTx {
            inner: self.inner.clone(),
        }
    }
}

/// Creates a new bounded message channel.
pub fn new_message_channel<T>(bound: usize) -> (MessageChannelTx<T>, MessageChannelRx<T>) {
    let (tx, rx) = imp::bounded(bound);
    (MessageChannelTx { inner: tx }, MessageChannelRx { inner: rx })
}

impl<T> MessageChannelTx<T> {
    /// Queues a message, suspending the caller while the channel is full.
    pub async fn send(&mut self, message: T) -> Result<()> {
        imp::send(&mut self.inner, message).await
    }

    /// Queues a message without ever suspending; full channels drop it.
    pub fn try_send(&mut self, message: T) -> Result<()> {
        imp::try_send(&mut self.inner, message)
    }
}

impl<T> MessageChannelRx<T> {
    /// Receives the next message, suspending while the channel is empty.
    pub async fn recv(&mut self) -> Result<T> {
        imp::recv(&mut self.inner).await
    }
}

#[cfg(feature = "channel_futures_mpsc")]
mod imp {
    use futures::{SinkExt, StreamExt};

    use crate::cluster::error::*;

    pub type Tx<T> = futures::channel::mpsc::Sender<T>;
    pub type Rx<T> = futures::channel::mpsc::Receiver<T>;

    pub fn bounded<T>(bound: usize) -> (Tx<T>, Rx<T>) {
        futures::channel::mpsc::channel(bound)
    }

    pub async fn send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.send(message)
            .await
            .simple(ErrorKind::CommunicationChannel)
    }

    pub fn try_send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.try_send(message)
            .simple(ErrorKind::CommunicationChannel)
    }

    pub async fn recv<T>(rx: &mut Rx<T>) -> Result<T> {
        rx.next()
            .await
            .ok_or_else(|| Error::simple(ErrorKind::CommunicationChannel))
    }
}

#[cfg(feature = "channel_flume_mpmc")]
mod imp {
    use crate::cluster::error::*;

    pub type Tx<T> = flume::Sender<T>;
    pub type Rx<T> = flume::Receiver<T>;

    pub fn bounded<T>(bound: usize) -> (Tx<T>, Rx<T>) {
        flume::bounded(bound)
    }

    pub async fn send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.send_async(message)
            .await
            .simple(ErrorKind::CommunicationChannel)
    }

    pub fn try_send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.try_send(message).simple(ErrorKind::CommunicationChannel)
    }

    pub async fn recv<T>(rx: &mut Rx<T>) -> Result<T> {
        rx.recv_async()
            .await
            .simple(ErrorKind::CommunicationChannel)
    }
}

#[cfg(feature = "channel_async_channel_mpmc")]
mod imp {
    use crate::cluster::error::*;

    pub type Tx<T> = async_channel::Sender<T>;
    pub type Rx<T> = async_channel::Receiver<T>;

    pub fn bounded<T>(bound: usize) -> (Tx<T>, Rx<T>) {
        async_channel::bounded(bound)
    }

    pub async fn send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.send(message)
            .await
            .simple(ErrorKind::CommunicationChannel)
    }

    pub fn try_send<T>(tx: &mut Tx<T>, message: T) -> Result<()> {
        tx.try_send(message).simple(ErrorKind::CommunicationChannel)
    }

    pub async fn recv<T>(rx: &mut Rx<T>) -> Result<T> {
        rx.recv().await.simple(ErrorKind::CommunicationChannel)
    }
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;

    use super::*;

    #[test]
    fn test_buffered_slot_roundtrip() {
        block_on(async {
            let slot = Slot::buffered();
            slot.put(42usize).await.expect("First put failed");
            assert_eq!(slot.fetch().await, 42);
            assert_eq!(slot.take().await, 42);
            assert!(slot.is_consumed());
        });
    }

    #[test]
    fn test_at_most_one_put() {
        block_on(async {
            let slot = Slot::buffered();
            slot.put(1usize).await.expect("First put failed");
            assert!(slot.put(2).await.is_err());
            // the error must not clobber the first value
            assert_eq!(slot.take().await, 1);
            assert!(slot.put_now(3).is_err());
        });
    }

    #[test]
    fn test_unbuffered_rendezvous() {
        block_on(async {
            let slot = Slot::unbuffered();
            let putter = slot.clone();
            let put = async move { putter.put(7usize).await };
            let take = async { slot.take().await };
            let (put, v) = futures::join!(put, take);
            put.expect("Rendezvous put failed");
            assert_eq!(v, 7);
        });
    }

    #[test]
    fn test_event_wakes_waiters() {
        block_on(async {
            let ev = Event::new();
            let waiter = ev.clone();
            let wait = async move { waiter.wait().await };
            let set = async {
                assert!(!ev.is_set());
                ev.set();
            };
            futures::join!(wait, set);
            assert!(ev.is_set());
        });
    }

    #[test]
    fn test_semaphore_limits_permits() {
        block_on(async {
            let sem = Semaphore::new(1);
            let first = sem.acquire().await;
            assert!(sem.shared.lock().permits == 0);
            drop(first);
            let _second = sem.acquire().await;
        });
    }

    #[test]
    fn test_message_channel_roundtrip() {
        block_on(async {
            let (mut tx, mut rx) = new_message_channel(4);
            tx.send(1usize).await.expect("Send failed");
            tx.try_send(2).expect("Try send failed");
            assert_eq!(rx.recv().await.expect("Recv failed"), 1);
            assert_eq!(rx.recv().await.expect("Recv failed"), 2);
        });
    }
}
