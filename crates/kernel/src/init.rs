//! Kernel bring-up.
//!
//! The initgraph targets below sequence the whole boot: the boot layer
//! hands over its data, `kernel_init` reaches the root target, and every
//! subsystem comes up strictly after its dependencies. The external
//! platform layer then wakes the APs and each core enters the scheduler.
//!
//! Nothing before the `mem/heap` target may allocate; boot data is kept
//! borrowed, not copied.

use spin::Once;

use crate::boot::{BootInfo, CpuDescriptor, MemoryAffinity, MemoryMapEntry, NumaTopology};
use crate::config::{PAGE_SIZE, PHYS_LOW, TASK_STACK_SIZE};
use crate::initgraph::{reach, Target};
use crate::mm::bootstrap::BootstrapAllocator;
use crate::mm::{align_up, numa_registry, PhysAddr, PhysWindow};
use crate::smp::percpu;

/// Boot inputs, parked here so the target callbacks (plain `fn()`) can
/// reach them. Everything is borrowed from boot-protocol memory or held
/// inline; the heap does not exist yet.
struct BootData {
    memory_map: &'static [MemoryMapEntry],
    affinity: &'static [MemoryAffinity],
    topology: NumaTopology,
    cpus: &'static [CpuDescriptor],
    window: PhysWindow,
    phys_space_size: usize,
    /// End of bootstrap-consumed memory; ranges begin past it.
    bootstrap_border: PhysAddr,
}

static BOOT_DATA: Once<BootData> = Once::new();

fn boot_data() -> &'static BootData {
    BOOT_DATA.get().expect("boot data not handed over")
}

static MEM_FEATURES: Target = Target::new("mem/features", &[], || {
    let data = boot_data();
    crate::info!(
        "mem",
        "physical window base {:#x}, {} byte physical space",
        data.window.base(),
        data.phys_space_size
    );
    if crate::arch::gib_pages_supported() {
        crate::info!("mem", "1 GiB pages supported");
    }
});

static NUMA_NODES: Target = Target::new("numa/nodes", &[&MEM_FEATURES], || {
    let data = boot_data();
    numa_registry().init_nodes(&data.topology, data.window);
});

/// Split `[start, end)` at affinity-region boundaries and report each
/// piece with its owning domain. Memory outside every region belongs to
/// the boot domain and is never hotpluggable.
fn for_each_affine_range(
    start: PhysAddr,
    end: PhysAddr,
    affinity: &[MemoryAffinity],
    boot_domain: u8,
    mut f: impl FnMut(PhysAddr, usize, u8, bool),
) {
    let mut cursor = start;
    while cursor < end {
        match affinity
            .iter()
            .find(|a| a.base <= cursor && cursor < a.end())
        {
            Some(region) => {
                let sub_end = end.min(region.end());
                f(cursor, sub_end - cursor, region.domain, region.hotpluggable);
                cursor = sub_end;
            }
            None => {
                let sub_end = affinity
                    .iter()
                    .map(|a| a.base)
                    .filter(|&b| b > cursor)
                    .min()
                    .map_or(end, |b| b.min(end));
                f(cursor, sub_end - cursor, boot_domain, false);
                cursor = sub_end;
            }
        }
    }
}

static MEM_RANGES: Target = Target::new("mem/ranges", &[&NUMA_NODES], || {
    let data = boot_data();
    let low_border = data.bootstrap_border.max(PHYS_LOW);
    let mut st = numa_registry().lock();
    for entry in data.memory_map.iter().filter(|e| e.is_usable()) {
        // Low memory and everything the bootstrap allocator consumed
        // stays out of reach.
        let start = entry.base.max(low_border);
        if start >= entry.end() {
            continue;
        }
        for_each_affine_range(
            start,
            entry.end(),
            data.affinity,
            data.topology.boot_domain,
            |base, length, domain, hotpluggable| {
                st.register_range(domain, base, length, hotpluggable)
                    .expect("memory range registration failed");
            },
        );
    }
});

static MEM_PHYS: Target = Target::new("mem/phys", &[&MEM_RANGES], || {
    let data = boot_data();
    crate::mm::phys::init_metadata(numa_registry(), data.phys_space_size)
        .expect("physical allocator metadata allocation failed");
});

static MEM_HEAP: Target = Target::new("mem/heap", &[&MEM_PHYS], || {
    // The heap has no init of its own: first use carves its first chunk.
    // Reaching this target just orders heap users after the physical
    // allocator.
});

static SMP_PERCPU: Target = Target::new("smp/percpu", &[&MEM_HEAP], || {
    let data = boot_data();
    let cpus = percpu::init(data.cpus);
    // Interrupt and scheduler stacks, NUMA-local per CPU.
    for cpu in cpus {
        let stack_size = align_up(TASK_STACK_SIZE, PAGE_SIZE);
        let interrupt_stack =
            crate::mm::phys::alloc_on_behalf(numa_registry(), cpu.numa_id, stack_size)
                .expect("interrupt stack allocation failed");
        let scheduler_stack =
            crate::mm::phys::alloc_on_behalf(numa_registry(), cpu.numa_id, stack_size)
                .expect("scheduler stack allocation failed");
        let window = data.window;
        cpu.interrupt_stack_top.store(
            window.translate(interrupt_stack) as usize + stack_size,
            core::sync::atomic::Ordering::Release,
        );
        cpu.scheduler_stack_top.store(
            window.translate(scheduler_stack) as usize + stack_size,
            core::sync::atomic::Ordering::Release,
        );
    }
});

static SMP_TOPOLOGY: Target = Target::new("smp/topology", &[&SMP_PERCPU], || {
    crate::smp::topology::build_flat(percpu::cpus());
});

static MEM_INVTLB: Target = Target::new("mem/invtlb", &[&SMP_PERCPU, &MEM_HEAP], || {
    crate::mm::invtlb::init_global(percpu::cpus().len());
});

static SCHED_READY: Target = Target::new("sched/ready", &[&SMP_TOPOLOGY, &MEM_INVTLB], || {
    // Sched-call and wake-up vectors are installed by the external
    // interrupt layer, which routes them to `schedcall::handle`,
    // `localsched::on_timer_interrupt` and `localsched::on_wakeup_ipi`.
});

static KERNEL_READY: Target = Target::new("kernel/ready", &[&SCHED_READY], || {
    crate::success!("init", "core bring-up complete");
});

/// Validate the boot handover and bring every core-kernel subsystem up in
/// dependency order. Called exactly once, on the boot CPU, before any
/// other core runs. `bootstrap` is terminated here: the physical
/// allocator owns memory from this point on.
pub fn kernel_init(
    boot: BootInfo<'static>,
    topology: NumaTopology,
    affinity: &'static [MemoryAffinity],
    cpus: &'static [CpuDescriptor],
    bootstrap: &mut BootstrapAllocator<'_>,
    window: PhysWindow,
) {
    boot.validate();
    let phys_space_size = boot.memory_map.iter().map(|e| e.end()).max().unwrap_or(0);
    let bootstrap_border = bootstrap.terminate();
    BOOT_DATA.call_once(|| BootData {
        memory_map: boot.memory_map,
        affinity,
        topology,
        cpus,
        window,
        phys_space_size: align_up(phys_space_size, PAGE_SIZE),
        bootstrap_border,
    });
    reach(&KERNEL_READY).expect("init cycle in the kernel bring-up graph");
}
