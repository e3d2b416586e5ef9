//! TLB shootdown coordination.
//!
//! Global invalidations are serialized through a phase-flip protocol: a
//! request flips the pending phase, and every online core adopts the new
//! phase at its next CR3 update, flushing as it does. The initiator never
//! spins. Idle cores are excluded from the count, since an idle core's
//! TLB holds nothing it will use; they adopt the current phase on wake.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::sync::SpinLock;

/// Per-core marker for a core that is idle rather than tracking phases.
const STATE_IDLE: u8 = 2;

/// What the CR3-update path must do after acknowledging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Core already observed the current generation.
    NoInvalidationRequired,
    /// Flush (reload CR3); other cores are still pending.
    FlushCr3,
    /// This core was the last one: flush, then run the generation update
    /// under the coordinator lock.
    GenerationUpdatePending,
}

struct TlbInner {
    idle_cores: usize,
    /// True while a global invalidation is in flight; gates `request`.
    pending: bool,
}

pub struct TlbCoordinator {
    /// Phase cores must end up on. A core whose state equals this value
    /// has not yet acknowledged the current generation.
    pending_phase: AtomicU8,
    pending_updates: AtomicUsize,
    states: Vec<AtomicU8>,
    inner: SpinLock<TlbInner>,
}

impl TlbCoordinator {
    /// Coordinator for `core_count` cores, all initially online and
    /// acknowledged.
    pub fn new(core_count: usize) -> Self {
        let mut states = Vec::with_capacity(core_count);
        // Phase 0 pending, so the acknowledged rest state is 1.
        states.resize_with(core_count, || AtomicU8::new(1));
        TlbCoordinator {
            pending_phase: AtomicU8::new(0),
            pending_updates: AtomicUsize::new(0),
            states,
            inner: SpinLock::new(TlbInner {
                idle_cores: 0,
                pending: false,
            }),
        }
    }

    pub fn core_count(&self) -> usize {
        self.states.len()
    }

    fn flip(phase: u8) -> u8 {
        1 - phase
    }

    /// Request a global invalidation on behalf of `core`. Returns early if
    /// one is already in flight; a new request may only start after the
    /// previous one completed. The caller must still flush its own CR3
    /// according to the returned action.
    pub fn request(&self, core: usize) -> AckAction {
        let mut inner = self.inner.lock();
        if inner.pending {
            return AckAction::NoInvalidationRequired;
        }
        inner.pending = true;
        let online = self.states.len() - inner.idle_cores;
        self.pending_updates.store(online, Ordering::Release);
        let phase = self.pending_phase.load(Ordering::Relaxed);
        self.pending_phase.store(Self::flip(phase), Ordering::Release);
        drop(inner);
        // Self-acknowledge; with every other core idle this finishes the
        // round on the spot.
        let action = self.ack(core);
        if action == AckAction::GenerationUpdatePending {
            let mut inner = self.inner.lock();
            self.finish_generation(&mut inner);
        }
        action
    }

    /// Acknowledge from a core's CR3-update path. Lock-free; the caller
    /// handles `GenerationUpdatePending` by taking the coordinator lock.
    pub fn ack(&self, core: usize) -> AckAction {
        let pending = self.pending_phase.load(Ordering::Acquire);
        if self.states[core].load(Ordering::Relaxed) != pending {
            return AckAction::NoInvalidationRequired;
        }
        self.states[core].store(Self::flip(pending), Ordering::Relaxed);
        let left = self.pending_updates.fetch_sub(1, Ordering::AcqRel) - 1;
        if left == 0 {
            AckAction::GenerationUpdatePending
        } else {
            AckAction::FlushCr3
        }
    }

    /// Run the generation update for a round whose last ack returned
    /// `GenerationUpdatePending`.
    pub fn complete_round(&self) {
        let mut inner = self.inner.lock();
        self.finish_generation(&mut inner);
    }

    /// Generation bump: the only defined effect is admitting the next
    /// global invalidation.
    fn finish_generation(&self, inner: &mut TlbInner) {
        inner.pending = false;
    }

    /// Core enters idle. Runs with interrupts disabled.
    pub fn idle_enter(&self, core: usize) {
        let mut inner = self.inner.lock();
        if self.ack(core) == AckAction::GenerationUpdatePending {
            self.finish_generation(&mut inner);
        }
        self.states[core].store(STATE_IDLE, Ordering::Relaxed);
        inner.idle_cores += 1;
    }

    /// Core leaves idle. It adopts the acknowledged state for the current
    /// phase: anything flushed while it slept is irrelevant to an empty
    /// TLB, and it will see the next flip like everyone else.
    pub fn idle_exit(&self, core: usize) {
        let mut inner = self.inner.lock();
        inner.idle_cores -= 1;
        let pending = self.pending_phase.load(Ordering::Relaxed);
        self.states[core].store(Self::flip(pending), Ordering::Relaxed);
    }

    /// True while a round is in flight.
    pub fn round_pending(&self) -> bool {
        self.inner.lock().pending
    }

    pub fn pending_updates(&self) -> usize {
        self.pending_updates.load(Ordering::Acquire)
    }
}

static GLOBAL: spin::Once<TlbCoordinator> = spin::Once::new();

/// Publish the kernel's coordinator once the CPU count is known.
pub fn init_global(core_count: usize) -> &'static TlbCoordinator {
    GLOBAL.call_once(|| TlbCoordinator::new(core_count))
}

/// The kernel's coordinator, if bring-up reached it yet. The scheduler's
/// idle path tolerates its absence during early boot.
pub fn global() -> Option<&'static TlbCoordinator> {
    GLOBAL.get()
}

/// Bare-metal CR3 update hook: acknowledges, flushes, and completes the
/// round when this core was the last.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn update_cr3(tlb: &TlbCoordinator, core: usize, old_cr3: usize, new_cr3: usize) {
    match tlb.ack(core) {
        AckAction::GenerationUpdatePending => {
            tlb.complete_round();
            // SAFETY: caller passes a live page-table root.
            unsafe { crate::arch::write_cr3(new_cr3) };
        }
        AckAction::FlushCr3 => unsafe { crate::arch::write_cr3(new_cr3) },
        AckAction::NoInvalidationRequired => {
            if old_cr3 != new_cr3 {
                // SAFETY: as above.
                unsafe { crate::arch::write_cr3(new_cr3) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_round_quiesces() {
        let tlb = TlbCoordinator::new(4);
        assert_eq!(tlb.request(0), AckAction::FlushCr3);
        assert!(tlb.round_pending());
        assert_eq!(tlb.ack(1), AckAction::FlushCr3);
        assert_eq!(tlb.ack(2), AckAction::FlushCr3);
        assert_eq!(tlb.ack(3), AckAction::GenerationUpdatePending);
        tlb.complete_round();
        assert!(!tlb.round_pending());
        assert_eq!(tlb.pending_updates(), 0);
        // Re-acking is a no-op.
        assert_eq!(tlb.ack(1), AckAction::NoInvalidationRequired);
    }

    #[test]
    fn request_is_gated_while_pending() {
        let tlb = TlbCoordinator::new(2);
        assert_eq!(tlb.request(0), AckAction::FlushCr3);
        // Second request while in flight: rejected.
        assert_eq!(tlb.request(1), AckAction::NoInvalidationRequired);
        assert_eq!(tlb.ack(1), AckAction::GenerationUpdatePending);
        tlb.complete_round();
        // Now a fresh round can start.
        assert_eq!(tlb.request(0), AckAction::FlushCr3);
    }

    #[test]
    fn idle_cores_are_excluded() {
        let tlb = TlbCoordinator::new(3);
        tlb.idle_enter(2);
        // Two online cores: requester plus core 1.
        assert_eq!(tlb.request(0), AckAction::FlushCr3);
        assert_eq!(tlb.ack(1), AckAction::GenerationUpdatePending);
        tlb.complete_round();
        // The woken core adopts the current phase and needs no flush.
        tlb.idle_exit(2);
        assert_eq!(tlb.ack(2), AckAction::NoInvalidationRequired);
    }

    #[test]
    fn lone_online_core_completes_in_request() {
        let tlb = TlbCoordinator::new(2);
        tlb.idle_enter(1);
        // The requester is the only online core; the round finishes
        // inside request (gen update included) and pending clears.
        assert_eq!(tlb.request(0), AckAction::GenerationUpdatePending);
        assert!(!tlb.round_pending());
        assert_eq!(tlb.pending_updates(), 0);
    }

    #[test]
    fn idle_enter_acks_outstanding_round() {
        let tlb = TlbCoordinator::new(2);
        assert_eq!(tlb.request(0), AckAction::FlushCr3);
        // Core 1 goes idle instead of acking from a CR3 update; the enter
        // path acks for it and completes the round.
        tlb.idle_enter(1);
        assert!(!tlb.round_pending());
        assert_eq!(tlb.pending_updates(), 0);
    }
}
