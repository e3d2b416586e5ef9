//! Kernel container library.
//!
//! Growable sequences and FIFO queues come from `alloc`; this module holds
//! the structures the allocator and scheduler need beyond that: the
//! scheduler's pairing heap, the integer-keyed bucket map backing RPC and
//! shared-memory registries, and the no-alloc arena used before the heap
//! comes up.

pub mod intmap;
pub mod pairing_heap;
pub mod pool;

pub use intmap::IntMap;
pub use pairing_heap::PairingHeap;
pub use pool::StaticPool;
