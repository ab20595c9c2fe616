//! Closable, optionally bounded FIFO channels for handing frames and packets
//! between threads.
//!
//! A channel is created as a pair of handles: a [Sender] that can only push
//! and a [Receiver] that can only pop. Both are cheap to clone and refer to the
//! same queue, which is freed once the last handle of either kind is dropped.
//!
//! Neither side ever waits for space or for data. [Sender::send] applies the
//! configured [Overflow] policy when the queue is full and [Receiver::receive]
//! returns [ChannelError::Empty] when there is nothing to pop; callers that
//! need to wait retry with their own backoff.
//!
//! ```
//! use netcore::channel::{self, Config, Overflow};
//! use netcore::ChannelError;
//!
//! let (tx, rx) = channel::channel(Config::bounded(2).with_policy(Overflow::DropOldest));
//!
//! tx.send(1).unwrap();
//! tx.send(2).unwrap();
//! tx.send(3).unwrap();
//!
//! assert_eq!(rx.receive(), Ok(2));
//! assert_eq!(rx.receive(), Ok(3));
//! assert_eq!(rx.receive(), Err(ChannelError::Empty));
//! ```

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::{error, fmt};

use crate::ChannelError;

/// What a full channel does with a new element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overflow {
    /// Reject the new element with [ChannelError::Limited].
    #[default]
    RejectNew,
    /// Evict the oldest queued element, then append the new one.
    DropOldest,
    /// Evict the most recently queued element, then append the new one.
    DropNewest,
}

/// Configuration used to construct a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Maximum number of queued elements, `None` for unbounded.
    pub capacity: Option<NonZeroUsize>,
    /// Policy applied when a send would exceed `capacity`.
    pub policy: Overflow,
}

impl Config {
    /// An unbounded channel. The overflow policy is never consulted.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A channel holding at most `capacity` elements, rejecting new elements
    /// when full.
    ///
    /// A `capacity` of zero is treated as one.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
            policy: Overflow::RejectNew,
        }
    }

    /// Sets the overflow policy.
    pub fn with_policy(mut self, policy: Overflow) -> Self {
        self.policy = policy;
        self
    }
}

/// Error returned by [Sender::send], handing back the element that could not
/// be queued.
pub struct SendError<T> {
    kind: ChannelError,
    value: T,
}

impl<T> SendError<T> {
    /// Either [ChannelError::Closed] or [ChannelError::Limited].
    pub fn kind(&self) -> ChannelError {
        self.kind
    }

    /// Returns the element that was not queued.
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl<T> error::Error for SendError<T> {}

impl<T> From<SendError<T>> for ChannelError {
    fn from(err: SendError<T>) -> ChannelError {
        err.kind
    }
}

impl<T> From<SendError<T>> for crate::Error {
    fn from(err: SendError<T>) -> crate::Error {
        crate::Error::Channel(err.kind)
    }
}

#[derive(Debug)]
struct State<T> {
    queue: VecDeque<T>,
    // Never cleared once set.
    closed: bool,
}

#[derive(Debug)]
struct Shared<T> {
    state: Mutex<State<T>>,
    capacity: Option<NonZeroUsize>,
    policy: Overflow,
}

impl<T> Shared<T> {
    /// Enters the critical section guarding the queue.
    ///
    /// Contending threads are parked by the mutex until the holder unlocks.
    /// Every operation leaves the queue consistent before unlocking, so a
    /// poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.lock();

        if state.closed {
            return Err(SendError {
                kind: ChannelError::Closed,
                value,
            });
        }

        if let Some(capacity) = self.capacity {
            if state.queue.len() >= capacity.get() {
                match self.policy {
                    Overflow::RejectNew => {
                        return Err(SendError {
                            kind: ChannelError::Limited,
                            value,
                        });
                    }
                    Overflow::DropOldest => {
                        state.queue.pop_front();
                    }
                    Overflow::DropNewest => {
                        state.queue.pop_back();
                    }
                }
            }
        }

        state.queue.push_back(value);

        Ok(())
    }

    fn receive(&self) -> Result<T, ChannelError> {
        let mut state = self.lock();

        // Elements queued before a close stay retrievable until drained.
        match state.queue.pop_front() {
            Some(value) => Ok(value),
            None if state.closed => Err(ChannelError::Closed),
            None => Err(ChannelError::Empty),
        }
    }

    fn close(&self) -> bool {
        let mut state = self.lock();

        if state.closed {
            return false;
        }

        state.closed = true;
        true
    }
}

/// Creates a connected [Sender] and [Receiver] pair sharing one queue.
pub fn channel<T>(config: Config) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            closed: false,
        }),
        capacity: config.capacity,
        policy: config.policy,
    });

    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

/// The sending half of a channel.
#[derive(Debug)]
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Appends `value` to the channel.
    ///
    /// # Errors
    ///
    /// Returns [ChannelError::Closed] if the channel has been closed, or
    /// [ChannelError::Limited] if the channel is full and its policy is
    /// [Overflow::RejectNew]. The element is handed back in both cases.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.shared.send(value)
    }

    /// Closes the channel for every handle. Returns `true` if this call closed
    /// it, `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns `true` if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Returns the number of queued elements.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Returns `true` if no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity limit, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity.map(NonZeroUsize::get)
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// The receiving half of a channel.
#[derive(Debug)]
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    /// Removes and returns the oldest queued element without waiting.
    ///
    /// # Errors
    ///
    /// Returns [ChannelError::Empty] if the channel is open but holds nothing,
    /// or [ChannelError::Closed] once the channel is closed and drained.
    pub fn receive(&self) -> Result<T, ChannelError> {
        self.shared.receive()
    }

    /// Closes the channel for every handle. Returns `true` if this call closed
    /// it, `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.shared.close()
    }

    /// Returns `true` if the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Returns the number of queued elements.
    pub fn len(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Returns `true` if no elements are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the capacity limit, `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity.map(NonZeroUsize::get)
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(v) = rx.receive() {
            out.push(v);
        }
        out
    }

    #[test]
    fn channel_fifo_unbounded() {
        let (tx, rx) = channel(Config::unbounded());

        for i in 0..100 {
            tx.send(i).unwrap();
        }

        assert_eq!(rx.len(), 100);
        assert_eq!(tx.capacity(), None);
        assert_eq!(drain(&rx), (0..100).collect::<Vec<_>>());
        assert_eq!(rx.receive(), Err(ChannelError::Empty));
    }

    #[test]
    fn channel_reject_new_limited() {
        let (tx, rx) = channel(Config::bounded(3));

        for i in 0..3 {
            tx.send(i).unwrap();
        }

        let err = tx.send(3).unwrap_err();
        assert_eq!(err.kind(), ChannelError::Limited);
        assert_eq!(err.into_inner(), 3);
        assert_eq!(tx.len(), 3);

        assert_eq!(drain(&rx), vec![0, 1, 2]);
    }

    #[test]
    fn channel_drop_oldest_evicts_front() {
        let (tx, rx) = channel(Config::bounded(3).with_policy(Overflow::DropOldest));

        for i in 0..3 {
            tx.send(i).unwrap();
        }
        tx.send(3).unwrap();

        assert_eq!(tx.len(), 3);
        assert_eq!(drain(&rx), vec![1, 2, 3]);
    }

    #[test]
    fn channel_drop_newest_evicts_back() {
        let (tx, rx) = channel(Config::bounded(3).with_policy(Overflow::DropNewest));

        for i in 0..3 {
            tx.send(i).unwrap();
        }
        tx.send(3).unwrap();
        tx.send(4).unwrap();

        assert_eq!(tx.len(), 3);
        assert_eq!(drain(&rx), vec![0, 1, 4]);
    }

    #[test]
    fn channel_zero_capacity_holds_one() {
        let (tx, rx) = channel(Config::bounded(0));

        assert_eq!(tx.capacity(), Some(1));
        tx.send('a').unwrap();
        assert_eq!(tx.send('b').unwrap_err().kind(), ChannelError::Limited);
        assert_eq!(rx.receive(), Ok('a'));
    }

    #[test]
    fn channel_close_drains_then_closed() {
        let (tx, rx) = channel(Config::unbounded());

        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert!(rx.close());
        assert!(tx.is_closed());

        assert_eq!(tx.send(3).unwrap_err().kind(), ChannelError::Closed);
        assert_eq!(rx.receive(), Ok(1));
        assert_eq!(rx.receive(), Ok(2));
        assert_eq!(rx.receive(), Err(ChannelError::Closed));
        assert_eq!(rx.receive(), Err(ChannelError::Closed));
    }

    #[test]
    fn channel_close_is_idempotent() {
        let (tx, rx) = channel::<u8>(Config::bounded(4));

        assert!(tx.close());
        assert!(!tx.close());
        assert!(!rx.close());
        assert!(rx.is_closed());
        assert_eq!(rx.receive(), Err(ChannelError::Closed));
    }

    #[test]
    fn channel_concurrent_close_exactly_once() {
        const THREADS: usize = 8;

        for _ in 0..50 {
            let (tx, rx) = channel::<u8>(Config::bounded(4));
            let barrier = Arc::new(Barrier::new(THREADS));

            let handles: Vec<_> = (0..THREADS)
                .map(|i| {
                    let barrier = Arc::clone(&barrier);
                    let (tx, rx) = (tx.clone(), rx.clone());
                    thread::spawn(move || {
                        barrier.wait();
                        if i % 2 == 0 { tx.close() } else { rx.close() }
                    })
                })
                .collect();

            let closed = handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|&closed| closed)
                .count();

            assert_eq!(closed, 1);
            assert!(tx.is_closed());
            assert_eq!(rx.receive(), Err(ChannelError::Closed));
        }
    }

    #[test]
    fn channel_send_on_closed_full_channel() {
        let (tx, _rx) = channel(Config::bounded(1));

        tx.send(0).unwrap();
        tx.close();

        // Closed takes precedence over the overflow policy.
        assert_eq!(tx.send(1).unwrap_err().kind(), ChannelError::Closed);
    }

    #[test]
    fn channel_cloned_handles_share_queue() {
        let (tx, rx) = channel(Config::unbounded());
        let tx2 = tx.clone();
        let rx2 = rx.clone();

        tx.send("a").unwrap();
        tx2.send("b").unwrap();

        assert_eq!(rx2.receive(), Ok("a"));
        assert_eq!(rx.receive(), Ok("b"));

        rx2.close();
        assert!(tx.is_closed());
        assert!(tx2.is_closed());
    }

    #[test]
    fn channel_queue_freed_with_last_handle() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;

        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (tx, rx) = channel(Config::unbounded());
        tx.send(Counted).unwrap();
        tx.send(Counted).unwrap();

        let tx2 = tx.clone();
        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 0);

        drop(tx2);
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_concurrent_producers_consumers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 1000;

        let (tx, rx) = channel::<(usize, usize)>(Config::unbounded());
        let barrier = Arc::new(Barrier::new(PRODUCERS));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|id| {
                let tx = tx.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for seq in 0..PER_PRODUCER {
                        tx.send((id, seq)).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    loop {
                        match rx.receive() {
                            Ok(item) => seen.push(item),
                            Err(ChannelError::Empty) => thread::yield_now(),
                            Err(ChannelError::Closed) => break seen,
                            Err(ChannelError::Limited) => unreachable!(),
                        }
                    }
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        tx.close();

        let mut total = 0;
        for c in consumers {
            let seen = c.join().unwrap();
            total += seen.len();

            // Each consumer observes every producer's elements in send order.
            let mut last = [None; PRODUCERS];
            for (id, seq) in seen {
                if let Some(prev) = last[id] {
                    assert!(seq > prev);
                }
                last[id] = Some(seq);
            }
        }

        assert_eq!(total, PRODUCERS * PER_PRODUCER);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Send(u32),
        Receive,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![any::<u32>().prop_map(Op::Send), Just(Op::Receive)]
    }

    fn policy() -> impl Strategy<Value = Overflow> {
        prop_oneof![
            Just(Overflow::RejectNew),
            Just(Overflow::DropOldest),
            Just(Overflow::DropNewest)
        ]
    }

    proptest! {
        #[test]
        fn channel_len_never_exceeds_capacity(
            capacity in 1usize..8,
            policy in policy(),
            ops in prop::collection::vec(op(), 0..64),
        ) {
            let (tx, rx) = channel(Config::bounded(capacity).with_policy(policy));

            for op in ops {
                match op {
                    Op::Send(v) => {
                        let full = tx.len() == capacity;
                        match tx.send(v) {
                            Ok(()) => prop_assert!(!full || policy != Overflow::RejectNew),
                            Err(err) => {
                                prop_assert!(full);
                                prop_assert_eq!(err.kind(), ChannelError::Limited);
                            }
                        }
                    }
                    Op::Receive => {
                        let empty = rx.is_empty();
                        prop_assert_eq!(rx.receive().is_err(), empty);
                    }
                }
                prop_assert!(tx.len() <= capacity);
            }
        }
    }
}
