//! Frame buffer pool (C2).
//!
//! A small ring of pre-allocated YUV plane triples per stream. The
//! decoder and renderer never allocate on the steady-state path: sizes
//! are fixed at stream-open (or at a deliberate, counted reallocation on
//! resolution change) and slots only change *ownership*, never size.
//!
//! Slot content and slot ownership are guarded by separate locks: a
//! worker decoding into slot `i` never blocks the renderer borrowing or
//! releasing slot `j`, and ownership bookkeeping is only ever held for
//! the duration of a state transition, never across a decode call.

pub mod aligned;
pub mod copier;

use aligned::AlignedBuffer;
use parking_lot::Mutex;

use crate::decode::Decoder;
use crate::error::DecodeOutcome;

/// Headroom applied to each axis when sizing pool allocations, so small
/// resolution changes don't force a reallocation.
pub const HEADROOM_FACTOR: f64 = 1.2;

/// Padded (width, height) for a plane allocation, rounded up.
pub fn padded_dims(width: u32, height: u32) -> (u32, u32) {
    (
        (width as f64 * HEADROOM_FACTOR).ceil() as u32,
        (height as f64 * HEADROOM_FACTOR).ceil() as u32,
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Decoding,
    Ready,
    HeldByRenderer,
}

/// One triple (Y, U, V) of plane buffers, plus the bookkeeping for the
/// most recently decoded frame's actual (unpadded) geometry.
pub struct FrameSlot {
    pub y: AlignedBuffer,
    pub u: AlignedBuffer,
    pub v: AlignedBuffer,
    /// Allocated (padded) luma dimensions.
    pub alloc_luma: (u32, u32),
    /// Allocated (padded) chroma dimensions.
    pub alloc_chroma: (u32, u32),
    /// Valid dimensions and strides of the last decoded frame.
    pub valid_luma: (u32, u32),
    pub valid_chroma: (u32, u32),
    pub y_stride: u32,
    pub u_stride: u32,
    pub v_stride: u32,
    pub pts: i64,
    pub ready: bool,
}

impl FrameSlot {
    fn new(luma: (u32, u32), chroma: (u32, u32)) -> Self {
        let y_size = luma.0 as usize * luma.1 as usize;
        let c_size = chroma.0 as usize * chroma.1 as usize;
        Self {
            y: AlignedBuffer::new(y_size),
            u: AlignedBuffer::new(c_size),
            v: AlignedBuffer::new(c_size),
            alloc_luma: luma,
            alloc_chroma: chroma,
            valid_luma: (0, 0),
            valid_chroma: (0, 0),
            y_stride: luma.0,
            u_stride: chroma.0,
            v_stride: chroma.0,
            pts: 0,
            ready: false,
        }
    }

    /// `true` when the last decode never exceeded the padded allocation,
    /// i.e. the dimension-bound invariant (§8.3) holds for this slot.
    pub fn within_allocation(&self) -> bool {
        self.valid_luma.0 <= self.alloc_luma.0
            && self.valid_luma.1 <= self.alloc_luma.1
            && self.valid_chroma.0 <= self.alloc_chroma.0
            && self.valid_chroma.1 <= self.alloc_chroma.1
    }
}

/// Ownership state, separate from slot content so it can be locked
/// independently and briefly.
struct Bookkeeping {
    states: Vec<SlotState>,
    /// Index of the most recently published slot not yet borrowed.
    latest_ready: Option<usize>,
    /// Index currently held by the renderer, if any.
    held: Option<usize>,
}

/// Owns a stream's ring of frame slots and arbitrates ownership between
/// the decode worker (producer) and the render loop (consumer).
pub struct Pool {
    slots: Vec<Mutex<FrameSlot>>,
    bookkeeping: Mutex<Bookkeeping>,
    native_dims: (u32, u32),
}

impl Pool {
    /// Allocate a pool sized for `width`×`height` with `slot_count`
    /// slots (2 or 3 per the design's open question).
    pub fn new(width: u32, height: u32, slot_count: usize) -> Self {
        assert!((2..=3).contains(&slot_count), "slot_count must be 2 or 3");
        let luma = padded_dims(width, height);
        let chroma = padded_dims(width / 2, height / 2);
        let slots = (0..slot_count)
            .map(|_| Mutex::new(FrameSlot::new(luma, chroma)))
            .collect();
        Self {
            slots,
            bookkeeping: Mutex::new(Bookkeeping {
                states: vec![SlotState::Free; slot_count],
                latest_ready: None,
                held: None,
            }),
            native_dims: (width, height),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// `true` if `(width, height)` still fits the pool's existing
    /// headroom; `false` means a reallocation is required.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        let (alloc_w, alloc_h) = padded_dims(self.native_dims.0, self.native_dims.1);
        width <= alloc_w && height <= alloc_h
    }

    /// Find a slot not referenced by the renderer and mark it *decoding*.
    /// Returns `None` if every slot is currently held or was the most
    /// recently published (the worker must wait for the renderer to
    /// release or borrow-past it).
    pub fn acquire_free(&self) -> Option<usize> {
        let mut bookkeeping = self.bookkeeping.lock();
        let idx = bookkeeping
            .states
            .iter()
            .position(|&state| state == SlotState::Free)?;
        bookkeeping.states[idx] = SlotState::Decoding;
        Some(idx)
    }

    /// Run `write` with exclusive access to slot `idx`'s buffers, then
    /// transition it *decoding → ready*. For writes that complete in one
    /// step; decode loops that may retry use [`Pool::decode_into`].
    pub fn publish<F: FnOnce(&mut FrameSlot)>(&self, idx: usize, write: F) {
        {
            let mut slot = self.slots[idx].lock();
            write(&mut slot);
            slot.ready = true;
        }
        let mut bookkeeping = self.bookkeeping.lock();
        debug_assert_eq!(bookkeeping.states[idx], SlotState::Decoding);
        bookkeeping.states[idx] = SlotState::Ready;
        bookkeeping.latest_ready = Some(idx);
    }

    /// Drive `decoder` against slot `idx` until it produces a frame or a
    /// terminal outcome, looping internally on [`DecodeOutcome::Retry`]
    /// without releasing the slot. Holds only slot `idx`'s lock for the
    /// duration, never the pool-wide bookkeeping lock, so the renderer
    /// can freely borrow or release any other slot while this runs.
    pub fn decode_into(&self, idx: usize, decoder: &mut dyn Decoder) -> DecodeOutcome {
        let outcome = {
            let mut slot = self.slots[idx].lock();
            loop {
                match decoder.next_frame(&mut slot) {
                    DecodeOutcome::Retry => continue,
                    outcome => {
                        if outcome == DecodeOutcome::Ok {
                            slot.ready = true;
                        }
                        break outcome;
                    }
                }
            }
        };

        let mut bookkeeping = self.bookkeeping.lock();
        debug_assert_eq!(bookkeeping.states[idx], SlotState::Decoding);
        match outcome {
            DecodeOutcome::Ok => {
                bookkeeping.states[idx] = SlotState::Ready;
                bookkeeping.latest_ready = Some(idx);
            }
            DecodeOutcome::Eof | DecodeOutcome::Fatal => {
                bookkeeping.states[idx] = SlotState::Free;
            }
            DecodeOutcome::Retry => unreachable!("retry is handled inside the slot-held loop"),
        }
        outcome
    }

    /// Atomically promote the most recently published slot to
    /// *held-by-renderer*. Returns `None` if nothing new has been
    /// published since the last successful borrow (the renderer should
    /// re-present its previously held slot and count a repeat).
    pub fn borrow_latest(&self) -> Option<usize> {
        let mut bookkeeping = self.bookkeeping.lock();
        let idx = bookkeeping.latest_ready.take()?;
        debug_assert_eq!(bookkeeping.states[idx], SlotState::Ready);
        // The slot the renderer is about to replace, if any, goes back
        // to free: the renderer never holds two slots at once.
        if let Some(previous) = bookkeeping.held.take() {
            if previous != idx {
                bookkeeping.states[previous] = SlotState::Free;
            }
        }
        bookkeeping.states[idx] = SlotState::HeldByRenderer;
        bookkeeping.held = Some(idx);
        Some(idx)
    }

    /// Run `read` with shared access to slot `idx`'s buffers. The caller
    /// must currently hold `idx` (via [`Pool::borrow_latest`]).
    pub fn with_slot<R>(&self, idx: usize, read: impl FnOnce(&FrameSlot) -> R) -> R {
        let slot = self.slots[idx].lock();
        read(&slot)
    }

    /// Return a *held-by-renderer* slot to *free*.
    pub fn release(&self, idx: usize) {
        let mut bookkeeping = self.bookkeeping.lock();
        debug_assert_eq!(bookkeeping.states[idx], SlotState::HeldByRenderer);
        bookkeeping.states[idx] = SlotState::Free;
        if bookkeeping.held == Some(idx) {
            bookkeeping.held = None;
        }
    }

    /// Index currently held by the renderer, for re-presenting the
    /// previous frame when [`Pool::borrow_latest`] returns `None`.
    pub fn currently_held(&self) -> Option<usize> {
        self.bookkeeping.lock().held
    }

    /// For the slot-ownership invariant test: counts of slots in each of
    /// {decoding, held-by-renderer}, each of which must be ≤ 1, and the
    /// total slot count.
    #[cfg(test)]
    fn ownership_counts(&self) -> (usize, usize, usize) {
        let bookkeeping = self.bookkeeping.lock();
        let decoding = bookkeeping
            .states
            .iter()
            .filter(|&&s| s == SlotState::Decoding)
            .count();
        let held = bookkeeping
            .states
            .iter()
            .filter(|&&s| s == SlotState::HeldByRenderer)
            .count();
        (decoding, held, bookkeeping.states.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padded_dims_apply_twenty_percent_headroom() {
        assert_eq!(padded_dims(1000, 1000), (1200, 1200));
        assert_eq!(padded_dims(1344, 1080), (1613, 1296));
    }

    #[test]
    fn slot_ownership_never_exceeds_one_per_category() {
        let pool = Pool::new(640, 480, 2);
        let a = pool.acquire_free().unwrap();
        pool.publish(a, |slot| slot.pts = 1);
        let borrowed = pool.borrow_latest().unwrap();
        assert_eq!(borrowed, a);

        let b = pool.acquire_free().unwrap();
        assert_ne!(a, b);
        pool.publish(b, |slot| slot.pts = 2);

        let (decoding, held, total) = pool.ownership_counts();
        assert!(decoding <= 1);
        assert!(held <= 1);
        assert_eq!(total, 2);
    }

    #[test]
    fn borrow_latest_is_none_when_nothing_new_since_last_borrow() {
        let pool = Pool::new(640, 480, 2);
        let a = pool.acquire_free().unwrap();
        pool.publish(a, |_| {});
        assert!(pool.borrow_latest().is_some());
        assert!(pool.borrow_latest().is_none());
    }

    #[test]
    fn renderer_holding_one_slot_does_not_block_worker_targeting_another() {
        let pool = Pool::new(640, 480, 2);
        let a = pool.acquire_free().unwrap();
        pool.publish(a, |_| {});
        let _held = pool.borrow_latest().unwrap();

        // The worker should still be able to acquire the other slot
        // while the renderer holds `a`.
        let b = pool.acquire_free();
        assert!(b.is_some());
        assert_ne!(b.unwrap(), a);
    }

    #[test]
    fn release_returns_slot_to_free_for_reacquisition() {
        let pool = Pool::new(640, 480, 2);
        let a = pool.acquire_free().unwrap();
        pool.publish(a, |_| {});
        let held = pool.borrow_latest().unwrap();
        pool.release(held);
        // Every slot should be acquirable again now.
        let again = pool.acquire_free();
        assert!(again.is_some());
    }

    #[test]
    fn decoded_dimensions_never_exceed_allocation() {
        let pool = Pool::new(1344, 1080, 2);
        let idx = pool.acquire_free().unwrap();
        pool.publish(idx, |slot| {
            slot.valid_luma = slot.alloc_luma;
            slot.valid_chroma = slot.alloc_chroma;
        });
        pool.with_slot(idx, |slot| assert!(slot.within_allocation()));
    }

    #[test]
    fn fits_reports_false_once_headroom_is_exceeded() {
        let pool = Pool::new(1000, 1000, 2);
        assert!(pool.fits(1100, 1100));
        assert!(pool.fits(1200, 1200));
        assert!(!pool.fits(1201, 1000));
    }

    struct ScriptedDecoder {
        outcomes: std::vec::IntoIter<DecodeOutcome>,
    }

    impl Decoder for ScriptedDecoder {
        fn dimensions(&self) -> (u32, u32) {
            (640, 480)
        }

        fn next_frame(&mut self, _slot: &mut FrameSlot) -> DecodeOutcome {
            self.outcomes.next().unwrap_or(DecodeOutcome::Fatal)
        }
    }

    #[test]
    fn decode_into_loops_through_retries_to_a_terminal_outcome() {
        let pool = Pool::new(640, 480, 2);
        let idx = pool.acquire_free().unwrap();
        let mut decoder = ScriptedDecoder {
            outcomes: vec![DecodeOutcome::Retry, DecodeOutcome::Retry, DecodeOutcome::Ok]
                .into_iter(),
        };
        let outcome = pool.decode_into(idx, &mut decoder);
        assert_eq!(outcome, DecodeOutcome::Ok);
        assert!(pool.borrow_latest().is_some());
    }

    #[test]
    fn decode_into_frees_the_slot_on_eof() {
        let pool = Pool::new(640, 480, 2);
        let idx = pool.acquire_free().unwrap();
        let mut decoder = ScriptedDecoder {
            outcomes: vec![DecodeOutcome::Eof].into_iter(),
        };
        assert_eq!(pool.decode_into(idx, &mut decoder), DecodeOutcome::Eof);
        assert!(pool.acquire_free().is_some());
    }
}
