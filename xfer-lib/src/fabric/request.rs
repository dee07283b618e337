//! Request arena.
//!
//! The fabric tails every in-flight operation with a small user area:
//! completion flag, an optionally held send buffer, and the link fields the
//! request chain threads through. Records live in a per-worker slab so a
//! token is just `(slot, generation)` and releasing one never frees heap
//! per operation.

/// Token for one in-flight fabric operation. Only meaningful to the worker
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqToken {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqState {
    Pending,
    Done,
    Failed(&'static str),
}

pub(crate) struct ReqSlot {
    generation: u32,
    pub(crate) state: ReqState,
    /// Serialized active-message payload kept alive until the send lands.
    pub(crate) am_buffer: Option<Vec<u8>>,
    /// Owner gave the token back while the operation was still queued; the
    /// executor frees the slot once it runs.
    detached: bool,
    // Chain links, as slot indices into the same arena.
    pub(crate) next: Option<u32>,
    pub(crate) prev: Option<u32>,
}

impl ReqSlot {
    fn reset(&mut self) {
        self.state = ReqState::Pending;
        self.am_buffer = None;
        self.detached = false;
        self.next = None;
        self.prev = None;
    }
}

#[derive(Default)]
pub(crate) struct ReqArena {
    slots: Vec<ReqSlot>,
    free: Vec<u32>,
}

impl ReqArena {
    pub(crate) fn alloc(&mut self) -> ReqToken {
        match self.free.pop() {
            Some(slot) => {
                let s = &mut self.slots[slot as usize];
                s.reset();
                ReqToken { slot, generation: s.generation }
            }
            None => {
                let slot = self.slots.len() as u32;
                self.slots.push(ReqSlot {
                    generation: 0,
                    state: ReqState::Pending,
                    am_buffer: None,
                    detached: false,
                    next: None,
                    prev: None,
                });
                ReqToken { slot, generation: 0 }
            }
        }
    }

    /// Live record for `tok`, or `None` if the token went stale (its slot
    /// was freed, and possibly reused, since).
    pub(crate) fn get(&mut self, tok: ReqToken) -> Option<&mut ReqSlot> {
        let s = self.slots.get_mut(tok.slot as usize)?;
        (s.generation == tok.generation).then_some(s)
    }

    pub(crate) fn get_by_slot(&mut self, slot: u32) -> &mut ReqSlot {
        &mut self.slots[slot as usize]
    }

    /// Current-generation token for a slot a chain is linked through.
    pub(crate) fn token_at(&self, slot: u32) -> ReqToken {
        ReqToken { slot, generation: self.slots[slot as usize].generation }
    }

    pub(crate) fn state(&self, tok: ReqToken) -> Option<ReqState> {
        let s = self.slots.get(tok.slot as usize)?;
        (s.generation == tok.generation).then_some(s.state)
    }

    /// Return `tok` to the arena. A still-pending operation keeps its slot
    /// alive in detached mode until the executor consumes it.
    pub(crate) fn release(&mut self, tok: ReqToken) {
        let Some(s) = self.get(tok) else { return };
        if s.state == ReqState::Pending {
            s.detached = true;
            return;
        }
        self.free(tok.slot);
    }

    /// Mark an executed (or skipped) operation complete. Frees the slot when
    /// its owner already let go of the token.
    pub(crate) fn complete(&mut self, tok: ReqToken) {
        self.finish(tok, ReqState::Done);
    }

    /// Terminal failure; surfaced by `test` until the token is released.
    pub(crate) fn fail(&mut self, tok: ReqToken, reason: &'static str) {
        self.finish(tok, ReqState::Failed(reason));
    }

    fn finish(&mut self, tok: ReqToken, state: ReqState) {
        let Some(s) = self.get(tok) else { return };
        s.state = state;
        let detached = s.detached;
        if detached {
            self.free(tok.slot);
        }
    }

    /// Abort a queued operation. The queue entry still holding this token
    /// turns stale and the executor skips it.
    pub(crate) fn cancel(&mut self, tok: ReqToken) {
        if let Some(s) = self.get(tok) {
            s.state = ReqState::Done;
        }
    }

    fn free(&mut self, slot: u32) {
        let s = &mut self.slots[slot as usize];
        s.generation = s.generation.wrapping_add(1);
        s.am_buffer = None;
        self.free.push(slot);
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_of_completed_token_recycles_slot() {
        let mut arena = ReqArena::default();
        let a = arena.alloc();
        arena.complete(a);
        arena.release(a);
        assert_eq!(arena.live_count(), 0);

        let b = arena.alloc();
        assert_eq!(b.slot, a.slot);
        assert_ne!(b.generation, a.generation);
        assert!(arena.get(a).is_none(), "stale token must not resolve");
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn release_of_pending_token_defers_free_to_completion() {
        let mut arena = ReqArena::default();
        let a = arena.alloc();
        arena.release(a);
        // Slot stays alive for the executor.
        assert_eq!(arena.live_count(), 1);
        assert_eq!(arena.state(a), Some(ReqState::Pending));

        arena.complete(a);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn cancel_then_release_frees_immediately() {
        let mut arena = ReqArena::default();
        let a = arena.alloc();
        arena.cancel(a);
        assert_eq!(arena.state(a), Some(ReqState::Done));
        arena.release(a);
        assert_eq!(arena.live_count(), 0);
    }

    #[test]
    fn held_am_buffer_is_dropped_on_free() {
        let mut arena = ReqArena::default();
        let a = arena.alloc();
        arena.get(a).unwrap().am_buffer = Some(vec![1, 2, 3]);
        arena.complete(a);
        arena.release(a);
        let b = arena.alloc();
        assert!(arena.get(b).unwrap().am_buffer.is_none());
    }
}
