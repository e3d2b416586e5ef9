//! Saved task context.

/// Register frame captured on interrupt entry and replayed on dispatch.
///
/// Layout matches the push order of the interrupt stubs: general registers,
/// then the hardware-pushed tail (`rip`/`cs`/`rflags`/`rsp`/`ss`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Interrupt-enable bit in `rflags`.
    pub const RFLAGS_IF: u64 = 1 << 9;
}
