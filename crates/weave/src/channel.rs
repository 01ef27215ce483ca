//! Channels built from future cells.
//!
//! Two flavors:
//!
//! - **Unbuffered** ([`unbuffered_channel`]): a single-producer
//!   single-consumer rendezvous. Two cells ping-pong between the sides:
//!   `value` carries the item (or the close marker), `ack` carries the
//!   consumer's acknowledgement. Each side rearms the cell the *other*
//!   side publishes into, at a point where the protocol guarantees the
//!   other side is not touching it.
//! - **Buffered** ([`buffered_channel`]): multi-producer multi-consumer
//!   bounded queue. A mutex protects the queue and two waiter lists;
//!   parked sides wait on stack-pinned cells which the opposite side
//!   fires *outside* the lock, because a wake can resume a routine inline.
//!
//! Closing is tied to handle drop: the last sender clone closes the send
//! side (outstanding `recv`s drain the queue, then return `None`), the
//! last receiver clone closes the receive side (parked senders return
//! `false`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::awaiter::await_on;
use crate::cell::FutureCell;
use crate::reactor::default_reactor;
use crate::routine::Routine;

// =============================================================================
// Unbuffered (rendezvous) channel
// =============================================================================

struct UnbufferedChannel<T: Send> {
    value: FutureCell<Option<T>>,
    ack: FutureCell<bool>,
}

impl<T: Send> UnbufferedChannel<T> {
    fn new() -> Self {
        Self {
            value: FutureCell::new(),
            ack: FutureCell::new(),
        }
    }

    /// Returns false once the receiver closed.
    fn push(&self, item: T) -> bool {
        self.value.set_value(Some(item));
        let accepted = await_on(&self.ack);
        // The consumer is parked in its next pop (or gone) by the time the
        // ack reaches us; the ack cell is ours to rearm.
        unsafe { self.ack.reset() };
        accepted
    }

    fn pop(&self) -> Option<T> {
        match await_on(&self.value) {
            Some(item) => {
                // Rearm before acking: the producer only touches `value`
                // again after it observes the ack.
                unsafe { self.value.reset() };
                self.ack.set_value(true);
                Some(item)
            }
            None => {
                // Keep the closed marker observable for later pops.
                unsafe { self.value.reset_ready(None) };
                None
            }
        }
    }

    fn close_sender(&self) {
        self.value.set_value(None);
    }

    /// Consumes one in-flight push (nacking it) or the close marker.
    /// Blocks until the producer sends or closes, mirroring the rendezvous
    /// contract.
    fn close_receiver(&self) {
        match await_on(&self.value) {
            Some(_) => {
                unsafe { self.value.reset() };
                self.ack.set_value(false);
            }
            None => unsafe { self.value.reset_ready(None) },
        }
    }
}

/// Sending half of an unbuffered channel. Dropping it closes the channel.
pub struct Sender<T: Send + 'static> {
    channel: Option<Arc<UnbufferedChannel<T>>>,
}

impl<T: Send + 'static> Sender<T> {
    /// Hand `item` to the receiver, suspending until it is taken. Returns
    /// false if the receiver is closed (the item is dropped).
    pub fn send(&mut self, item: T) -> bool {
        self.channel
            .as_ref()
            .expect("send on a closed sender")
            .push(item)
    }

    pub fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close_sender();
        }
    }
}

impl<T: Send + 'static> Drop for Sender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving half of an unbuffered channel.
///
/// Iterating consumes items until the sender closes. Dropping the receiver
/// while the sender is still open suspends until the producer's next send
/// (which is then refused) or close.
pub struct Receiver<T: Send + 'static> {
    channel: Option<Arc<UnbufferedChannel<T>>>,
}

impl<T: Send + 'static> Receiver<T> {
    /// Take the next item; `None` once the sender closed.
    pub fn recv(&mut self) -> Option<T> {
        self.channel.as_ref().expect("recv on a closed receiver").pop()
    }

    pub fn close(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close_receiver();
        }
    }
}

impl<T: Send + 'static> Iterator for Receiver<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

impl<T: Send + 'static> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A rendezvous channel: `send` suspends until the matching `recv` and
/// vice versa.
pub fn unbuffered_channel<T: Send + 'static>() -> (Sender<T>, Receiver<T>) {
    let channel = Arc::new(UnbufferedChannel::new());
    (
        Sender {
            channel: Some(channel.clone()),
        },
        Receiver {
            channel: Some(channel),
        },
    )
}

// =============================================================================
// Buffered channel
// =============================================================================

struct SenderWaiter(*const FutureCell<bool>);
struct ReceiverWaiter<T>(*const FutureCell<Option<T>>);
// Waiter cells live on frames parked until fired; see module docs.
unsafe impl Send for SenderWaiter {}
unsafe impl<T> Send for ReceiverWaiter<T> {}

struct BufferedState<T> {
    queue: VecDeque<T>,
    capacity: usize,
    waiting_senders: VecDeque<SenderWaiter>,
    waiting_receivers: VecDeque<ReceiverWaiter<T>>,
    sender_closed: bool,
    receiver_closed: bool,
}

struct BufferedChannel<T: Send> {
    state: StdMutex<BufferedState<T>>,
}

impl<T: Send> BufferedChannel<T> {
    fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffered channel capacity must be non-zero");
        Self {
            state: StdMutex::new(BufferedState {
                queue: VecDeque::new(),
                capacity,
                waiting_senders: VecDeque::new(),
                waiting_receivers: VecDeque::new(),
                sender_closed: false,
                receiver_closed: false,
            }),
        }
    }

    fn push(&self, item: T) -> bool {
        let cell = FutureCell::new();
        let mut handoff = None;
        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(!state.sender_closed);
            if let Some(receiver) = state.waiting_receivers.pop_front() {
                debug_assert!(!state.receiver_closed);
                handoff = Some((receiver, item));
                cell.set_value(true);
            } else if state.receiver_closed {
                cell.set_value(false);
            } else {
                state.queue.push_back(item);
                if state.queue.len() >= state.capacity {
                    state.waiting_senders.push_back(SenderWaiter(&cell));
                } else {
                    cell.set_value(true);
                }
            }
        }
        if let Some((receiver, item)) = handoff {
            unsafe { (*receiver.0).set_value(Some(item)) };
        }
        await_on(&cell)
    }

    fn pop(&self) -> Option<T> {
        let cell = FutureCell::new();
        let mut wake_sender = None;
        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(!state.receiver_closed);
            if let Some(item) = state.queue.pop_front() {
                cell.set_value(Some(item));
                wake_sender = state.waiting_senders.pop_front();
            } else if state.sender_closed {
                debug_assert!(state.waiting_senders.is_empty());
                cell.set_value(None);
            } else {
                state.waiting_receivers.push_back(ReceiverWaiter(&cell));
            }
        }
        if let Some(sender) = wake_sender {
            unsafe { (*sender.0).set_value(true) };
        }
        await_on(&cell)
    }

    fn close_sender(&self) {
        let receivers = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(!state.sender_closed);
            debug_assert!(state.waiting_senders.is_empty());
            state.sender_closed = true;
            std::mem::take(&mut state.waiting_receivers)
        };
        for receiver in receivers {
            unsafe { (*receiver.0).set_value(None) };
        }
    }

    fn close_receiver(&self) {
        let senders = {
            let mut state = self.state.lock().unwrap();
            debug_assert!(!state.receiver_closed);
            debug_assert!(state.waiting_receivers.is_empty());
            state.receiver_closed = true;
            std::mem::take(&mut state.waiting_senders)
        };
        for sender in senders {
            unsafe { (*sender.0).set_value(false) };
        }
    }

    fn set_capacity(&self, capacity: usize) {
        assert!(capacity > 0, "buffered channel capacity must be non-zero");
        let wake = {
            let mut state = self.state.lock().unwrap();
            let mut wake = Vec::new();
            if state.queue.len() < capacity {
                for _ in state.capacity..capacity {
                    match state.waiting_senders.pop_front() {
                        Some(sender) => wake.push(sender),
                        None => break,
                    }
                }
            }
            state.capacity = capacity;
            wake
        };
        for sender in wake {
            unsafe { (*sender.0).set_value(true) };
        }
    }
}

struct BufferedShared<T: Send> {
    channel: BufferedChannel<T>,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

/// Clonable sending half of a buffered channel. The channel's send side
/// closes when the last clone drops.
pub struct BufferedSender<T: Send + 'static> {
    shared: Arc<BufferedShared<T>>,
}

impl<T: Send + 'static> BufferedSender<T> {
    /// Enqueue `item`; suspends while the queue is at capacity. Returns
    /// false if the receive side is closed.
    pub fn send(&self, item: T) -> bool {
        self.shared.channel.push(item)
    }

    /// Resize the queue; growing it releases parked senders up to the new
    /// limit.
    pub fn set_capacity(&self, capacity: usize) {
        self.shared.channel.set_capacity(capacity);
    }
}

impl<T: Send + 'static> Clone for BufferedSender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for BufferedSender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.channel.close_sender();
        }
    }
}

/// Clonable receiving half of a buffered channel. The channel's receive
/// side closes when the last clone drops.
pub struct BufferedReceiver<T: Send + 'static> {
    shared: Arc<BufferedShared<T>>,
}

impl<T: Send + 'static> BufferedReceiver<T> {
    /// Take the next item; suspends while the queue is empty. `None` once
    /// the send side closed and the queue drained.
    pub fn recv(&self) -> Option<T> {
        self.shared.channel.pop()
    }
}

impl<T: Send + 'static> Clone for BufferedReceiver<T> {
    fn clone(&self) -> Self {
        self.shared.receivers.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Drop for BufferedReceiver<T> {
    fn drop(&mut self) {
        if self.shared.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.channel.close_receiver();
        }
    }
}

impl<T: Send + 'static> Iterator for BufferedReceiver<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

/// A bounded multi-producer multi-consumer channel.
pub fn buffered_channel<T: Send + 'static>(
    capacity: usize,
) -> (BufferedSender<T>, BufferedReceiver<T>) {
    let shared = Arc::new(BufferedShared {
        channel: BufferedChannel::new(capacity),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });
    (
        BufferedSender {
            shared: shared.clone(),
        },
        BufferedReceiver { shared },
    )
}

// =============================================================================
// generate
// =============================================================================

/// Spawn a detached producer routine feeding an unbuffered channel and
/// return the receiving end. The channel closes when `f` returns.
pub fn generate<T, F>(f: F) -> Receiver<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Sender<T>) + Send + 'static,
{
    let (sender, receiver) = unbuffered_channel();
    Routine::with_reactor(default_reactor(), move || {
        let mut sender = sender;
        f(&mut sender);
    })
    .detach();
    receiver
}
