//! Task scheduling.
//!
//! Each core runs its own scheduler over a pairing heap keyed by
//! unfairness (accumulated cycles; lower is more deserving). Preemption,
//! yield, suspension and termination all funnel through the
//! scheduler-stack call, so every context switch runs on a stack no task
//! owns. The balancer places newly runnable tasks on the least-loaded
//! core.

pub mod balancer;
pub mod localsched;
pub mod queue;
pub mod schedcall;
pub mod task;
