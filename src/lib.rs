//! A lock-free double buffer for sharing the latest value between threads
//!
//! In this crate, we implement a double buffering mechanism which lets one
//! single producer thread hand over its most recent value to one single
//! consumer thread, without either side ever blocking or allocating.
//!
//! The producer writes into one of two embedded cells while the consumer reads
//! the other one. Which cell is which, and whether each cell holds an unread
//! value, is negotiated through a single atomic state word. Unlike a queue,
//! this channel only guarantees delivery of the latest published value: if the
//! producer publishes twice before the consumer looks, the older value is
//! silently superseded.
//!
//! ```
//! use spsc_double_buffer::DoubleBuffer;
//!
//! // Create a double buffer of any Default type
//! let mut buf = DoubleBuffer::<u32>::default();
//!
//! // Split it into an input and output interface, to be respectively sent to
//! // the producer thread and the consumer thread
//! let (mut buf_input, mut buf_output) = buf.split();
//!
//! // Nothing has been published yet
//! assert!(buf_output.start_reading().is_none());
//!
//! // The producer can move a value into the buffer at any time...
//! buf_input.write(42);
//!
//! // ...or fill the writable cell in place
//! *buf_input.start_writing() = 43;
//!
//! // The consumer gets the latest value, and only once
//! assert_eq!(buf_output.read(), Some(43));
//! assert_eq!(buf_output.read(), None);
//! ```
//!
//! Both interfaces borrow the buffer, so they are typically moved into the
//! threads of a `std::thread::scope`.

#![deny(missing_debug_implementations, missing_docs)]

use crossbeam_utils::CachePadded;
use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// A double buffer, useful for nonblocking and thread-safe "latest value"
/// exchange between one producer and one consumer
///
/// The buffer owns its two storage cells and its state word outright. To use
/// it, split it into an [`Input`] for the producer and an [`Output`] for the
/// consumer. The type system then guarantees that there is exactly one of
/// each, and that every access region is properly closed.
///
pub struct DoubleBuffer<T> {
    /// Data storage cells
    cells: [CachePadded<UnsafeCell<T>>; 2],

    /// Packed state word, see [`State`] for the encoding
    state: CachePadded<AtomicUsize>,
}
//
impl<T: Clone> DoubleBuffer<T> {
    /// Construct a double buffer whose two cells start as clones of `initial`
    ///
    /// The initial value is never reported as published data. It only matters
    /// to producers which update the writable cell in place.
    ///
    pub fn new(initial: &T) -> Self {
        Self::from_cells(initial.clone(), initial.clone())
    }
}
//
impl<T> DoubleBuffer<T> {
    /// Build a double buffer out of its two cells
    fn from_cells(cell0: T, cell1: T) -> Self {
        Self {
            cells: [
                CachePadded::new(UnsafeCell::new(cell0)),
                CachePadded::new(UnsafeCell::new(cell1)),
            ],
            state: CachePadded::new(AtomicUsize::new(State::INITIAL.bits())),
        }
    }

    /// Extract the producer and consumer interfaces of the double buffer
    ///
    /// The interfaces borrow the buffer, which therefore cannot be accessed
    /// in any other way until both of them have been dropped. Splitting again
    /// afterwards resumes from the values the previous interfaces left
    /// behind, closing any access whose guard was leaked.
    ///
    pub fn split(&mut self) -> (Input<'_, T>, Output<'_, T>) {
        // Holding &mut self proves that every earlier interface and guard is
        // gone, so any access still counted in the state word was leaked
        let state = self.state.get_mut();
        *state = State::from_bits(*state).settled().bits();

        let shared = &*self;
        (
            Input {
                shared,
                writing: false,
            },
            Output {
                shared,
                reading: None,
            },
        )
    }

    /// Snapshot of the state word
    fn load_state(&self) -> State {
        State::from_bits(self.state.load(Ordering::Relaxed))
    }

    /// Enter the write path, returning the index of the active cell
    fn begin_write(&self) -> usize {
        // Once we are counted as a user, nobody can swap the active cell
        // until we are done. Acquire ordering makes sure that the consumer is
        // done with whatever cell it handed back to us.
        let state = State::from_bits(self.state.fetch_add(State::USER, Ordering::Acquire));
        debug_assert!(state.users() < 2, "more than one writer or reader");
        state.active()
    }

    /// Leave the write path, publishing the active cell
    fn end_write(&self) {
        // The active cell and its full flag cannot change under our feet
        // while we are counted as a user, so the update can be precomputed
        let delta = self.load_state().publish_delta();
        let state = State::from_bits(
            self.state
                .fetch_add(delta, Ordering::Release)
                .wrapping_add(delta),
        );
        debug_assert!(state.is_full(state.active()));

        // If the consumer is not in the middle of a read, swap now, emptying
        // the cell that we will reuse so that an older value there can never
        // be read after the one we just published. If the state moved in the
        // meantime, the consumer took over the swap obligation.
        if state.users() == 0 {
            let _ = self.state.compare_exchange(
                state.bits(),
                state.producer_swap().bits(),
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
    }

    /// Try to enter the read path, returning the index of the readable cell
    fn begin_read(&self) -> Option<usize> {
        // Check for unread data without touching the state word
        let state = self.load_state();
        if !state.is_full(state.readable()) {
            return None;
        }

        // The producer never clears the full flag of the readable cell
        // without setting that of the cell it swaps in, so there is still
        // something to read, though possibly in the other cell by now.
        let state = State::from_bits(
            self.state
                .fetch_add(State::USER, Ordering::Acquire)
                .wrapping_add(State::USER),
        );
        debug_assert!(state.users() <= 2, "more than one writer or reader");
        debug_assert!(state.is_full(state.readable()));
        Some(state.readable())
    }

    /// Leave the read path, marking the cell that was read as consumed
    fn end_read(&self, cell: usize) {
        let release = State::full_flag(cell) | State::USER;
        let old_state = State::from_bits(self.state.fetch_sub(release, Ordering::Release));
        debug_assert!(old_state.is_full(cell) && old_state.users() > 0);
        let state = State::from_bits(old_state.bits().wrapping_sub(release));

        // If the producer published while we were reading, it could not swap,
        // so it is up to us to bring its value into reach.
        if state.users() == 0 && state.is_full(state.active()) {
            let _ = self.state.compare_exchange(
                state.bits(),
                state.flipped().bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            );
        }
    }
}
//
impl<T: Default> Default for DoubleBuffer<T> {
    fn default() -> Self {
        Self::from_cells(T::default(), T::default())
    }
}
//
impl<T> fmt::Debug for DoubleBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Cells are not shown, since T is only required to be Send
        f.debug_struct("DoubleBuffer")
            .field("state", &self.load_state())
            .finish_non_exhaustive()
    }
}
//
// Each cell is only ever accessed by one thread at a time, as negotiated
// through the state word, so moving values across threads is all we need.
unsafe impl<T: Send> Sync for DoubleBuffer<T> {}

/// Producer interface to the double buffer
///
/// The producer of data can use this struct to submit updates to the double
/// buffer whenever it likes. Writes never block and never fail, whatever the
/// consumer is doing.
///
pub struct Input<'buf, T> {
    /// Reference-counting is unnecessary, the buffer outlives us
    shared: &'buf DoubleBuffer<T>,

    /// A write guard was leaked while holding an access to the active cell
    writing: bool,
}
//
impl<T> Input<'_, T> {
    /// Get exclusive access to the writable cell
    ///
    /// The cell contains whatever was last stored there, which may be a value
    /// from two publications ago or the initial value: it is up to the caller
    /// to overwrite or update it as appropriate. The new contents are
    /// published when the returned guard is dropped.
    ///
    /// If a previous guard was leaked, this resumes its access to the same
    /// cell instead of opening a new one.
    ///
    pub fn start_writing(&mut self) -> WriteGuard<'_, T> {
        let cell = if self.writing {
            // Our access is still counted, so the active cell has not moved
            self.shared.load_state().active()
        } else {
            self.writing = true;
            self.shared.begin_write()
        };
        WriteGuard {
            shared: self.shared,
            writing: &mut self.writing,
            cell,
            _value: PhantomData,
        }
    }

    /// Publish a new value
    pub fn write(&mut self, value: T) {
        *self.start_writing() = value;
    }

    /// Check if the consumer has fetched every value that was published
    ///
    /// This is only a hint: the answer may be outdated as soon as it is
    /// returned if the consumer is concurrently reading.
    ///
    pub fn consumed(&self) -> bool {
        let state = self.shared.load_state();
        !(state.is_full(0) || state.is_full(1))
    }
}
//
impl<T> fmt::Debug for Input<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The cells may be in use by the consumer, only show the state word
        f.debug_struct("Input")
            .field("state", &self.shared.load_state())
            .field("writing", &self.writing)
            .finish()
    }
}

/// Exclusive access to the writable cell, publishing it on drop
pub struct WriteGuard<'input, T> {
    shared: &'input DoubleBuffer<T>,
    writing: &'input mut bool,
    cell: usize,

    /// Sharing the guard shares the value, so T must be Sync for that
    _value: PhantomData<&'input mut T>,
}
//
impl<T> WriteGuard<'_, T> {
    /// Publish the cell right away
    ///
    /// This is equivalent to dropping the guard.
    ///
    pub fn end_writing(self) {}
}
//
impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // This is safe because the active cell cannot be swapped while we are
        // counted as a user, and the consumer never reads the active cell.
        unsafe { &*self.shared.cells[self.cell].get() }
    }
}
//
impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Same as above, and the guard mutably borrows the only Input
        unsafe { &mut *self.shared.cells[self.cell].get() }
    }
}
//
impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.end_write();
        *self.writing = false;
    }
}
//
impl<T: fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteGuard")
            .field("cell", &self.cell)
            .field("value", &**self)
            .finish()
    }
}

/// Consumer interface to the double buffer
///
/// The consumer of data can use this struct to fetch the latest value
/// published by the producer whenever it likes. Reads never block: when
/// nothing new was published since the last read, they report it instead.
///
pub struct Output<'buf, T> {
    /// Reference-counting is unnecessary, the buffer outlives us
    shared: &'buf DoubleBuffer<T>,

    /// Cell held by a leaked read guard, if any
    reading: Option<usize>,
}
//
impl<T> Output<'_, T> {
    /// Get exclusive access to the latest published value, if there is one
    ///
    /// Returns `None` when no value was published since the last successful
    /// read. Otherwise, the value is marked as consumed when the returned
    /// guard is dropped.
    ///
    /// If a previous guard was leaked, this resumes its access to the same
    /// cell instead of opening a new one.
    ///
    pub fn start_reading(&mut self) -> Option<ReadGuard<'_, T>> {
        let cell = match self.reading {
            Some(cell) => cell,
            None => self.shared.begin_read()?,
        };
        self.reading = Some(cell);
        Some(ReadGuard {
            shared: self.shared,
            reading: &mut self.reading,
            cell,
            _value: PhantomData,
        })
    }

    /// Check if a call to `start_reading` would currently yield a value
    ///
    /// Only the producer can change the answer from `false` to `true`, so a
    /// positive answer stays valid until the next read.
    ///
    pub fn updated(&self) -> bool {
        let state = self.shared.load_state();
        self.reading.is_some() || state.is_full(state.readable())
    }
}
//
impl<T: Clone> Output<'_, T> {
    /// Fetch a copy of the latest published value, if there is one
    pub fn read(&mut self) -> Option<T> {
        self.start_reading().map(|guard| T::clone(&guard))
    }
}
//
impl<T> fmt::Debug for Output<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The cells may be in use by the producer, only show the state word
        f.debug_struct("Output")
            .field("state", &self.shared.load_state())
            .field("reading", &self.reading)
            .finish()
    }
}

/// Exclusive access to the readable cell, consuming it on drop
pub struct ReadGuard<'output, T> {
    shared: &'output DoubleBuffer<T>,
    reading: &'output mut Option<usize>,
    cell: usize,

    /// Sharing the guard shares the value, so T must be Sync for that
    _value: PhantomData<&'output mut T>,
}
//
impl<T> ReadGuard<'_, T> {
    /// Mark the value as consumed right away
    ///
    /// This is equivalent to dropping the guard.
    ///
    pub fn end_reading(self) {}
}
//
impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // This is safe because the producer only ever writes to the active
        // cell, which cannot be swapped while we are counted as a user.
        unsafe { &*self.shared.cells[self.cell].get() }
    }
}
//
impl<T> DerefMut for ReadGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Same as above, and the guard mutably borrows the only Output
        unsafe { &mut *self.shared.cells[self.cell].get() }
    }
}
//
impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.shared.end_read(self.cell);
        *self.reading = None;
    }
}
//
impl<T: fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadGuard")
            .field("cell", &self.cell)
            .field("value", &**self)
            .finish()
    }
}

/// Double buffer state word
///
/// All coordination between the producer and the consumer goes through one
/// atomic integer, packed as follows from the lowest bit up:
///
/// - Bit 0 is the index of the active cell, which the producer writes to. The
///   consumer reads the other one.
/// - Bits 1 and 2 count the threads currently inside a read or write access
///   (0, 1 or 2). The active cell may only be swapped when this is zero.
/// - Bit 3 is set when cell 0 holds a published value that was not consumed.
/// - Bit 4 is the same for cell 1.
///
#[derive(Clone, Copy, PartialEq, Eq)]
struct State(usize);
//
impl State {
    /// Bit holding the active cell index
    const ACTIVE_BIT: usize = 0b00001;

    /// Increment of the access count
    const USER: usize = 0b00010;

    /// Bits holding the access count
    const USERS_MASK: usize = 0b00110;

    /// Full flag of cell 0, that of cell 1 comes right after
    const FULL_FLAG_0: usize = 0b01000;

    /// Cell 0 active, no user, nothing to read
    const INITIAL: State = State(0);

    const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    const fn bits(self) -> usize {
        self.0
    }

    /// Index of the cell that the producer writes to
    const fn active(self) -> usize {
        self.0 & Self::ACTIVE_BIT
    }

    /// Index of the cell that the consumer reads from
    const fn readable(self) -> usize {
        self.active() ^ 1
    }

    /// Number of threads inside an access region
    const fn users(self) -> usize {
        (self.0 & Self::USERS_MASK) >> 1
    }

    /// Full flag of a certain cell
    const fn full_flag(cell: usize) -> usize {
        Self::FULL_FLAG_0 << cell
    }

    /// Truth that a certain cell holds an unread value
    const fn is_full(self, cell: usize) -> bool {
        (self.0 & Self::full_flag(cell)) != 0
    }

    /// Addend which sets the full flag of the active cell (if need be) and
    /// removes one user, for use with a wrapping fetch_add
    const fn publish_delta(self) -> usize {
        (Self::full_flag(self.active()) & !self.0).wrapping_sub(Self::USER)
    }

    /// Swap performed by the producer: the readable cell becomes active, and
    /// any value it held is dropped
    const fn producer_swap(self) -> Self {
        Self((self.0 ^ Self::ACTIVE_BIT) & !Self::full_flag(self.readable()))
    }

    /// Swap performed by the consumer: only the active cell changes
    const fn flipped(self) -> Self {
        Self(self.0 ^ Self::ACTIVE_BIT)
    }

    /// State once all users are gone, including the swap that a leaked
    /// access may have prevented
    const fn settled(self) -> Self {
        let idle = Self(self.0 & !Self::USERS_MASK);
        if idle.is_full(idle.active()) && !idle.is_full(idle.readable()) {
            idle.flipped()
        } else {
            idle
        }
    }
}
//
impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("active", &self.active())
            .field("users", &self.users())
            .field("full", &[self.is_full(0), self.is_full(1)])
            .finish()
    }
}
