//! Thread lifecycle and the context switch
//!
//! Threads are heap-allocated with their own kernel stacks. The switch
//! saves the callee-saved registers on the outgoing stack and swaps
//! stack pointers; a fresh thread's stack is seeded so the first switch
//! returns into the trampoline.

use super::{scheduler_lock, scheduler_unlock};
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

const DEFAULT_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping,
    Zombie,
}

/// Saved stack pointer; everything else lives on the thread's stack
#[repr(C)]
struct Context {
    sp: u64,
}

pub struct Thread {
    pub tid: u64,
    pub name: String,
    state: Mutex<ThreadState>,
    context: UnsafeCell<Context>,
    entry: Option<fn()>,
    _stack: Option<Vec<u8>>,
    wake_deadline: AtomicU64,
    is_idle: bool,
}

// State is only mutated under the scheduler lock
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

struct SchedulerState {
    ready: VecDeque<Arc<Thread>>,
    sleeping: Vec<Arc<Thread>>,
    zombies: Vec<Arc<Thread>>,
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    /// The most recently switched-away thread. Keeps a dying thread's
    /// stack alive until the switch that leaves it has fully completed.
    retired: Option<Arc<Thread>>,
    active: bool,
}

static SCHEDULER: Mutex<SchedulerState> = Mutex::new(SchedulerState {
    ready: VecDeque::new(),
    sleeping: Vec::new(),
    zombies: Vec::new(),
    current: None,
    idle: None,
    retired: None,
    active: false,
});

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

core::arch::global_asm!(
    ".global __thread_switch",
    "__thread_switch:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn __thread_switch(old: *mut Context, new: *const Context);
}

/// First frame of every spawned thread
extern "C" fn thread_trampoline() -> ! {
    // The switch into a fresh thread happens with the lock held
    scheduler_unlock();

    let entry = {
        let state = SCHEDULER.lock();
        state.current.as_ref().and_then(|t| t.entry)
    };
    if let Some(entry) = entry {
        entry();
    }
    task_exit();
}

fn alloc_thread(name: &str, entry: Option<fn()>, is_idle: bool) -> Arc<Thread> {
    let mut stack = vec![0u8; DEFAULT_STACK_SIZE];

    // Seed the stack: padding to keep rsp % 16 == 8 at trampoline entry,
    // the trampoline return address, then six callee-saved slots
    let top = unsafe { stack.as_mut_ptr().add(DEFAULT_STACK_SIZE) } as u64;
    let top = top & !0xF;
    let sp = unsafe {
        let mut sp = top as *mut u64;
        sp = sp.sub(1);
        *sp = 0;
        sp = sp.sub(1);
        *sp = thread_trampoline as usize as u64;
        for _ in 0..6 {
            sp = sp.sub(1);
            *sp = 0;
        }
        sp as u64
    };

    Arc::new(Thread {
        tid: NEXT_TID.fetch_add(1, Ordering::SeqCst),
        name: String::from(name),
        state: Mutex::new(ThreadState::Ready),
        context: UnsafeCell::new(Context { sp }),
        entry,
        _stack: Some(stack),
        wake_deadline: AtomicU64::new(0),
        is_idle,
    })
}

fn idle_entry() {
    loop {
        // Park until an interrupt, then let woken sleepers run
        x86_64::instructions::hlt();
        task_yield();
    }
}

/// Set up the bootstrap and idle threads
pub fn init() {
    let mut state = SCHEDULER.lock();
    if state.active {
        return;
    }

    let bootstrap = Arc::new(Thread {
        tid: 0,
        name: String::from("bootstrap"),
        state: Mutex::new(ThreadState::Running),
        context: UnsafeCell::new(Context { sp: 0 }),
        entry: None,
        _stack: None,
        wake_deadline: AtomicU64::new(0),
        is_idle: false,
    });
    state.current = Some(bootstrap);

    let idle = alloc_thread("idle", Some(idle_entry), true);
    state.idle = Some(idle);

    state.active = true;
    crate::log!("[SCHED] thread system ready");
}

/// Create a runnable kernel thread
pub fn spawn(name: &str, entry: fn()) -> Option<Arc<Thread>> {
    scheduler_lock();
    let thread = {
        let mut state = SCHEDULER.lock();
        if !state.active {
            scheduler_unlock();
            return None;
        }
        let thread = alloc_thread(name, Some(entry), false);
        state.ready.push_back(thread.clone());
        thread
    };
    scheduler_unlock();
    Some(thread)
}

/// Called under the scheduler lock: wake due sleepers, drop zombies
fn housekeep_locked(state: &mut SchedulerState) {
    let now = crate::time::uptime_ms();
    let mut woke = Vec::new();
    state.sleeping.retain(|t| {
        if t.wake_deadline.load(Ordering::SeqCst) <= now {
            woke.push(t.clone());
            false
        } else {
            true
        }
    });
    for t in woke {
        *t.state.lock() = ThreadState::Ready;
        state.ready.push_back(t);
    }
    state.zombies.clear();
}

/// Pick the next runnable thread and switch to it.
/// `requeue_current` keeps the outgoing thread on the ready queue.
fn schedule_locked(requeue_current: bool) {
    let (old_ctx, new_ctx) = {
        let mut state = SCHEDULER.lock();
        housekeep_locked(&mut state);

        let next = match state.ready.pop_front() {
            Some(t) => t,
            None => match state.idle.clone() {
                Some(i) => i,
                None => return,
            },
        };

        let previous = state.current.clone();
        if let Some(prev) = &previous {
            if Arc::ptr_eq(prev, &next) {
                *prev.state.lock() = ThreadState::Running;
                return;
            }
            if requeue_current && !prev.is_idle && *prev.state.lock() == ThreadState::Running {
                *prev.state.lock() = ThreadState::Ready;
                state.ready.push_back(prev.clone());
            }
        }

        *next.state.lock() = ThreadState::Running;
        state.current = Some(next.clone());

        // The outgoing thread may only be referenced by the zombie list,
        // which housekeeping drains; park it so its context outlives the
        // switch below.
        state.retired = previous.clone();

        let old_ctx = previous
            .map(|p| p.context.get())
            .unwrap_or(core::ptr::null_mut());
        (old_ctx, next.context.get() as *const Context)
    };

    if old_ctx.is_null() {
        return;
    }
    unsafe { __thread_switch(old_ctx, new_ctx) };
}

/// Give up the CPU, staying runnable
pub fn task_yield() {
    {
        let state = SCHEDULER.lock();
        if !state.active {
            return;
        }
    }
    scheduler_lock();
    schedule_locked(true);
    scheduler_unlock();
}

/// Sleep at least `ms` milliseconds against the uptime clock
pub fn task_sleep_ms(ms: u64) {
    scheduler_lock();
    {
        let mut state = SCHEDULER.lock();
        if !state.active {
            drop(state);
            scheduler_unlock();
            return;
        }
        let Some(current) = state.current.clone() else {
            drop(state);
            scheduler_unlock();
            return;
        };
        if current.is_idle {
            drop(state);
            scheduler_unlock();
            return;
        }
        current
            .wake_deadline
            .store(crate::time::uptime_ms() + ms, Ordering::SeqCst);
        *current.state.lock() = ThreadState::Sleeping;
        state.sleeping.push(current);
    }
    schedule_locked(false);
    scheduler_unlock();
}

/// Terminate the current thread
pub fn task_exit() -> ! {
    scheduler_lock();
    {
        let mut state = SCHEDULER.lock();
        if let Some(current) = state.current.clone() {
            *current.state.lock() = ThreadState::Zombie;
            state.zombies.push(current);
        }
    }
    schedule_locked(false);
    scheduler_unlock();

    // A zombie never runs again; if it does, park the CPU
    loop {
        x86_64::instructions::hlt();
    }
}
