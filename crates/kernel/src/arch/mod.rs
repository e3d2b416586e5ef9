//! Architecture access layer.
//!
//! Everything that touches privileged processor state lives here: the
//! interrupt flag, TSC, control registers, the GS-based per-CPU pointer and
//! the scheduler-stack software interrupt. Bare-metal x86-64 builds get the
//! real implementations; hosted builds get inert stand-ins so the rest of
//! the kernel compiles and unit-tests anywhere.

mod frame;

pub use frame::InterruptFrame;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use self::x86_64::*;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod hosted;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub use self::hosted::*;
