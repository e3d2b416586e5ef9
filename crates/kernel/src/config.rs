//! Kernel-wide tunables.
//!
//! Single source of truth for geometry and capacity constants; subsystems
//! must not restate these numbers locally.

/// Smallest physical allocation granularity as a power of two.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// End of low physical memory; nothing below this is ever handed out.
pub const PHYS_LOW: usize = 2 * 1024 * 1024;

/// Number of order classes in a physical slub (orders `PAGE_SHIFT..64`).
pub const PHYS_ORDER_COUNT: usize = 64;

/// Bootstrap allocations round up to this many bytes.
pub const BOOTSTRAP_ALIGN: usize = 16;

/// Heap slub size; also its alignment, so headers resolve by masking.
pub const HEAP_SLUB_SIZE: usize = 64 * 1024;

/// Slubs requested from the physical allocator per refill chunk.
pub const HEAP_CHUNK_SLUBS: usize = 64;

/// Smallest heap size class as a power of two (16 bytes).
pub const HEAP_MIN_ORDER: usize = 4;

/// One past the largest heap order; larger requests bypass to the
/// physical allocator.
pub const HEAP_ORDER_COUNT: usize = 12;

/// Maximum NUMA nodes tracked.
pub const MAX_NUMA_NODES: usize = 16;

/// Memory range objects available before the heap exists.
pub const MAX_MEMORY_RANGES: usize = 128;

/// Memory ranges attachable to a single node.
pub const MAX_RANGES_PER_NODE: usize = 32;

/// Floor of the scheduler timeslice in microseconds.
pub const TIMESLICE_MIN_US: u64 = 10_000;

/// Default scheduler timeslice in microseconds.
pub const TIMESLICE_DEFAULT_US: u64 = 20_000;

/// Kernel stack size for tasks and per-CPU stacks.
pub const TASK_STACK_SIZE: usize = 64 * 1024;

/// Software interrupt vector for scheduler-stack calls.
pub const SCHED_CALL_VECTOR: u8 = 0x57;

/// Dummy IPI vector used to abort `hlt` on idle cores.
pub const WAKEUP_IPI_VECTOR: u8 = 0x69;

/// Shards of the global shared-memory id registry.
pub const SHM_SHARDS: usize = 64;

/// Buckets inside one shared-memory registry shard.
pub const SHM_SHARD_BUCKETS: usize = 16;

/// Buckets in a thread-local-storage table.
pub const TLS_BUCKETS: usize = 16;

/// Maximum RPC message payload in bytes.
pub const RPC_MAX_PAYLOAD: usize = 112;

/// Maximum IPC stream message payload in bytes.
pub const IPC_MAX_PAYLOAD: usize = 120;

/// Spin iterations before a debug build declares a deadlock.
pub const SPIN_DEADLOCK_TRIES: usize = 10_000_000;
