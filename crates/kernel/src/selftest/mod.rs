//! In-kernel self-tests.
//!
//! The scenarios that need real context switching (blocking notification
//! waits, mutex handoff, cross-core placement) cannot run as hosted unit
//! tests. With the `selftest` feature enabled, the platform calls
//! [`run_all`] from the first spawned task once the scheduler is live.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cap::entry::ApiEntry;
use crate::cap::mailbox::note_kind;
use crate::cap::rpc::RpcMessage;
use crate::sched::{balancer, localsched};
use crate::sync::Mutex;

const SUB: &str = "selftest";

/// RPC calls exchanged by the ping test.
const RPC_PING_CALLS: u64 = 10_000_000;

struct RpcServerParams {
    entry: ApiEntry,
    hmailbox: usize,
    hcallee: usize,
    done: &'static AtomicUsize,
}

extern "C" fn rpc_server(arg: usize) -> ! {
    // SAFETY: the box was leaked by run_rpc_ping for this task alone.
    let params = unsafe { alloc::boxed::Box::from_raw(arg as *mut RpcServerParams) };
    for i in 0..RPC_PING_CALLS {
        let note = params
            .entry
            .get_notification(params.hmailbox)
            .expect("server notification");
        assert_eq!(note.kind, note_kind::RPC_INCOMING);
        assert_eq!(note.opaque, 0xdeadbeef);
        let msg = params.entry.rpc_accept(params.hcallee).expect("accept");
        assert_eq!(msg.opaque, i, "request sequence out of order");
        params
            .entry
            .rpc_return(params.hcallee, &msg)
            .expect("return");
    }
    crate::info!(SUB, "rpc server finished");
    params.done.fetch_add(1, Ordering::Release);
    localsched::terminate();
}

struct RpcClientParams {
    entry: ApiEntry,
    hmailbox: usize,
    hcaller: usize,
    htoken: usize,
    done: &'static AtomicUsize,
}

extern "C" fn rpc_client(arg: usize) -> ! {
    // SAFETY: the box was leaked by run_rpc_ping for this task alone.
    let params = unsafe { alloc::boxed::Box::from_raw(arg as *mut RpcClientParams) };
    for _ in 0..RPC_PING_CALLS {
        let mut msg = RpcMessage::default();
        msg.opaque = 0xabacaba;
        msg.status = 1;
        params
            .entry
            .rpc_call(params.hcaller, params.htoken, &msg)
            .expect("call");
        let note = params
            .entry
            .get_notification(params.hmailbox)
            .expect("client notification");
        assert_eq!(note.kind, note_kind::RPC_REPLY);
        assert_eq!(note.opaque, 0xcafebabe);
        let reply = params
            .entry
            .rpc_recv_reply(params.hcaller)
            .expect("recv reply");
        assert_eq!(reply.opaque, 0xabacaba);
        assert_eq!(reply.status, 1);
    }
    crate::info!(SUB, "rpc client finished");
    params.done.fetch_add(1, Ordering::Release);
    localsched::terminate();
}

/// Client and server tasks hammering one caller/callee pair with blocking
/// notification waits in both directions.
pub fn run_rpc_ping() {
    static DONE: AtomicUsize = AtomicUsize::new(0);
    let client_entry = ApiEntry::new().expect("client entry");
    let server_entry = ApiEntry::new().expect("server entry");

    let h_cmb = client_entry.create_mailbox(8).expect("client mailbox");
    let h_smb = server_entry.create_mailbox(8).expect("server mailbox");
    let h_caller = client_entry
        .create_caller(h_cmb, 0xcafebabe)
        .expect("caller");
    let (h_callee, h_token) = server_entry
        .create_callee(h_smb, 0xdeadbeef, 0)
        .expect("callee");
    let token_slot = server_entry.move_handle_out(h_token).expect("token out");
    let h_token = client_entry.move_handle_in(token_slot).expect("token in");

    let server = alloc::boxed::Box::new(RpcServerParams {
        entry: server_entry,
        hmailbox: h_smb,
        hcallee: h_callee,
        done: &DONE,
    });
    let client = alloc::boxed::Box::new(RpcClientParams {
        entry: client_entry,
        hmailbox: h_cmb,
        hcaller: h_caller,
        htoken: h_token,
        done: &DONE,
    });
    balancer::spawn(rpc_server, alloc::boxed::Box::into_raw(server) as usize)
        .expect("spawn server");
    balancer::spawn(rpc_client, alloc::boxed::Box::into_raw(client) as usize)
        .expect("spawn client");
    while DONE.load(Ordering::Acquire) != 2 {
        localsched::yield_current();
    }
    crate::success!(SUB, "rpc ping: {} calls", RPC_PING_CALLS);
}

struct MutexParams {
    counter: Arc<Mutex<u64>>,
    done: &'static AtomicUsize,
}

extern "C" fn mutex_worker(arg: usize) -> ! {
    // SAFETY: the box was leaked by run_mutex_storm for this task alone.
    let params = unsafe { alloc::boxed::Box::from_raw(arg as *mut MutexParams) };
    for _ in 0..100_000 {
        *params.counter.lock() += 1;
    }
    params.done.fetch_add(1, Ordering::Release);
    localsched::terminate();
}

/// Contended mutex increments across every core; the total must come out
/// exact, or the park-and-release handoff lost a wake-up.
pub fn run_mutex_storm() {
    static DONE: AtomicUsize = AtomicUsize::new(0);
    const WORKERS: usize = 8;
    let counter = Arc::new(Mutex::new(0u64));
    for _ in 0..WORKERS {
        let params = alloc::boxed::Box::new(MutexParams {
            counter: Arc::clone(&counter),
            done: &DONE,
        });
        balancer::spawn(mutex_worker, alloc::boxed::Box::into_raw(params) as usize)
            .expect("spawn worker");
    }
    while DONE.load(Ordering::Acquire) != WORKERS {
        localsched::yield_current();
    }
    assert_eq!(*counter.lock(), (WORKERS as u64) * 100_000);
    crate::success!(SUB, "mutex storm: counter exact");
}

extern "C" fn yielder(arg: usize) -> ! {
    let done = unsafe { &*(arg as *const AtomicUsize) };
    for _ in 0..10_000 {
        localsched::yield_current();
    }
    done.fetch_add(1, Ordering::Release);
    localsched::terminate();
}

/// Cooperative yield churn across cores; finishes iff requeue keeps every
/// task runnable.
pub fn run_yield_churn() {
    static DONE: AtomicUsize = AtomicUsize::new(0);
    const TASKS: usize = 16;
    for _ in 0..TASKS {
        balancer::spawn(yielder, &DONE as *const AtomicUsize as usize).expect("spawn yielder");
    }
    while DONE.load(Ordering::Acquire) != TASKS {
        localsched::yield_current();
    }
    crate::success!(SUB, "yield churn: {} tasks", TASKS);
}

/// Run every self-test. Call from a spawned task, never from the
/// bootstrap context.
pub fn run_all() {
    crate::info!(SUB, "running in-kernel self-tests");
    run_yield_churn();
    run_mutex_storm();
    run_rpc_ping();
    crate::success!(SUB, "all self-tests passed");
}
