//! Dependency-ordered subsystem initialization.
//!
//! Bring-up is declared as a graph of one-shot targets; reaching a target
//! first reaches everything it depends on. Resolution is an iterative
//! depth-first walk threaded through intrusive `next` links on the targets
//! themselves, so it runs before any allocator exists.

use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

const UNRESOLVED: u8 = 0;
const WAITING_FOR_DEPS: u8 = 1;
const RESOLVED: u8 = 2;

/// One initialization unit.
///
/// Targets are usually statics; the callback runs exactly once globally,
/// strictly after every dependency's callback.
pub struct Target {
    name: &'static str,
    deps: &'static [&'static Target],
    callback: fn(),
    status: AtomicU8,
    /// Resolution-stack link, live only inside [`reach`].
    next: AtomicPtr<Target>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// The named target participates in a dependency cycle.
    CircularDependency(&'static str),
}

impl Target {
    pub const fn new(name: &'static str, deps: &'static [&'static Target], callback: fn()) -> Self {
        Target {
            name,
            deps,
            callback,
            status: AtomicU8::new(UNRESOLVED),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_resolved(&self) -> bool {
        self.status.load(Ordering::Acquire) == RESOLVED
    }
}

/// Resolve `root` and everything it depends on.
///
/// Already-resolved targets are skipped; re-reaching a resolved root is a
/// no-op. Returns `CircularDependency` naming the first target found on a
/// cycle, leaving the graph partially resolved. The walk is single-threaded
/// by contract (boot CPU only); there is no parallel initialization.
pub fn reach(root: &Target) -> Result<(), InitError> {
    if root.is_resolved() {
        return Ok(());
    }
    root.next.store(core::ptr::null_mut(), Ordering::Relaxed);
    let mut stack_top: Option<&Target> = Some(root);

    while let Some(current) = stack_top {
        if current.status.load(Ordering::Relaxed) == UNRESOLVED {
            // WAITING marks the targets currently on the stack chain, which
            // is what makes the cycle check below work.
            current.status.store(WAITING_FOR_DEPS, Ordering::Relaxed);
        }
        // Deps are re-scanned every time the walk returns to this target, so
        // a dependency shared between siblings is pushed at most where it is
        // still unresolved and never linked twice.
        let pending = current
            .deps
            .iter()
            .find(|d| d.status.load(Ordering::Relaxed) != RESOLVED);
        match pending {
            Some(dep) => {
                if dep.status.load(Ordering::Relaxed) == WAITING_FOR_DEPS {
                    crate::err!(
                        "initgraph",
                        "circular dependency: \"{}\" while resolving \"{}\"",
                        dep.name,
                        current.name
                    );
                    return Err(InitError::CircularDependency(dep.name));
                }
                dep.next
                    .store(current as *const Target as *mut Target, Ordering::Relaxed);
                stack_top = Some(dep);
            }
            None => {
                // Every dependency is resolved; pop and run.
                let next = current.next.load(Ordering::Relaxed);
                stack_top = if next.is_null() {
                    None
                } else {
                    // SAFETY: next links only ever point at targets pushed
                    // during this walk, all of which outlive it.
                    Some(unsafe { &*next })
                };
                (current.callback)();
                current.status.store(RESOLVED, Ordering::Release);
                crate::success!("initgraph", "target \"{}\" reached", current.name);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};

    static ORDER: AtomicUsize = AtomicUsize::new(0);
    static A_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
    static B_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
    static C_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
    static RUNS: AtomicUsize = AtomicUsize::new(0);

    fn stamp(slot: &AtomicUsize) {
        slot.store(ORDER.fetch_add(1, O::SeqCst), O::SeqCst);
        RUNS.fetch_add(1, O::SeqCst);
    }

    static A: Target = Target::new("a", &[], || stamp(&A_AT));
    static B: Target = Target::new("b", &[&A], || stamp(&B_AT));
    static C: Target = Target::new("c", &[&A, &B], || stamp(&C_AT));

    #[test]
    fn dependencies_run_first_and_once() {
        reach(&C).unwrap();
        assert!(A_AT.load(O::SeqCst) < B_AT.load(O::SeqCst));
        assert!(B_AT.load(O::SeqCst) < C_AT.load(O::SeqCst));
        assert!(C.is_resolved());
        let runs = RUNS.load(O::SeqCst);
        // Reaching again must not rerun callbacks.
        reach(&C).unwrap();
        reach(&B).unwrap();
        assert_eq!(RUNS.load(O::SeqCst), runs);
    }

    #[test]
    fn cycle_is_reported() {
        static X: Target = Target::new("x", &[&Y], || {});
        static Y: Target = Target::new("y", &[&X], || {});
        match reach(&X) {
            Err(InitError::CircularDependency(name)) => assert_eq!(name, "x"),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn diamond_resolves_each_node_once() {
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        static BASE: Target = Target::new("base", &[], || {
            COUNT.fetch_add(1, O::SeqCst);
        });
        static L: Target = Target::new("l", &[&BASE], || {});
        static R: Target = Target::new("r", &[&BASE], || {});
        static TOP: Target = Target::new("top", &[&L, &R], || {});
        reach(&TOP).unwrap();
        assert_eq!(COUNT.load(O::SeqCst), 1);
        assert!(L.is_resolved() && R.is_resolved());
    }

    #[test]
    fn deep_chain_resolves_in_order() {
        // Local clock, so this cannot race the sibling test's counters.
        static CLOCK: AtomicUsize = AtomicUsize::new(0);
        fn tick(slot: &AtomicUsize) {
            slot.store(CLOCK.fetch_add(1, O::SeqCst), O::SeqCst);
        }
        static D0: Target = Target::new("d0", &[], || tick(&D0_AT));
        static D1: Target = Target::new("d1", &[&D0], || tick(&D1_AT));
        static D2: Target = Target::new("d2", &[&D1], || tick(&D2_AT));
        static D3: Target = Target::new("d3", &[&D2], || tick(&D3_AT));
        static D0_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
        static D1_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
        static D2_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
        static D3_AT: AtomicUsize = AtomicUsize::new(usize::MAX);
        reach(&D3).unwrap();
        assert!(D0_AT.load(O::SeqCst) < D1_AT.load(O::SeqCst));
        assert!(D1_AT.load(O::SeqCst) < D2_AT.load(O::SeqCst));
        assert!(D2_AT.load(O::SeqCst) < D3_AT.load(O::SeqCst));
    }
}
