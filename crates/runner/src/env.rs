//! The runner's `Environment` implementation.
//!
//! Locking discipline: one global mutex around the memory engine. Every
//! fast-path handle and every transaction serializes on it, which keeps
//! overlapping accesses from concurrently stepping cores well ordered;
//! non-overlapping accesses pay the same lock, a deliberate simplicity
//! trade documented by the protocol.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cpulink_protocol::{
    page_base, DirectPage, Environment, Response, Transaction, PAGE_SIZE,
};

use crate::memory::MemoryRegion;

/// Locks a mutex, recovering the guard if a peer thread panicked.
fn relock<T: ?Sized>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-core delivery queues the scheduler drains between quanta.
///
/// Invalidation notices and due events cannot be pushed into a core while
/// it owns its thread mid-step, so the environment parks them here and the
/// core's own thread applies them at the next quantum boundary.
#[derive(Default)]
pub struct CoreMailbox {
    invalidations: Mutex<Vec<(u64, u64)>>,
    events: Mutex<Vec<u64>>,
}

impl CoreMailbox {
    /// Takes all pending translation-invalidation ranges.
    #[must_use]
    pub fn drain_invalidations(&self) -> Vec<(u64, u64)> {
        std::mem::take(&mut *relock(&self.invalidations))
    }

    /// Takes all events that became due since the last drain.
    #[must_use]
    pub fn drain_events(&self) -> Vec<u64> {
        std::mem::take(&mut *relock(&self.events))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScheduledEvent {
    id: u64,
    due_ps: u64,
}

/// Fast-path handle to one page of the shared region.
struct RegionPage {
    mem: Arc<Mutex<MemoryRegion>>,
    page_addr: u64,
    writable: bool,
}

impl DirectPage for RegionPage {
    fn read(&self, offset: usize, buf: &mut [u8]) -> bool {
        if offset + buf.len() > PAGE_SIZE as usize {
            return false;
        }
        relock(&self.mem).read_at(self.page_addr + offset as u64, buf)
    }

    fn write(&self, offset: usize, buf: &[u8]) -> bool {
        if !self.writable || offset + buf.len() > PAGE_SIZE as usize {
            return false;
        }
        relock(&self.mem).write_at(self.page_addr + offset as u64, buf)
    }
}

/// The host-side capability surface shared by every core of one run.
pub struct RunnerEnv {
    mem: Arc<Mutex<MemoryRegion>>,
    port_addr: u64,
    sink: Mutex<Box<dyn Write + Send>>,
    params: BTreeMap<String, String>,
    signals: Mutex<BTreeMap<u64, bool>>,
    events: Mutex<Vec<ScheduledEvent>>,
    now_ps: AtomicU64,
    syscalls: AtomicU64,
    mailboxes: Mutex<Vec<Arc<CoreMailbox>>>,
}

impl RunnerEnv {
    /// Wraps `region` with the default stdout output sink.
    #[must_use]
    pub fn new(region: MemoryRegion, port_addr: u64, params: BTreeMap<String, String>) -> Self {
        Self::with_sink(region, port_addr, params, Box::new(io::stdout()))
    }

    /// Wraps `region` with an injectable output sink (used by tests).
    #[must_use]
    pub fn with_sink(
        region: MemoryRegion,
        port_addr: u64,
        mut params: BTreeMap<String, String>,
        sink: Box<dyn Write + Send>,
    ) -> Self {
        // Cores discover the port through the parameter surface.
        params
            .entry("output-port".to_owned())
            .or_insert_with(|| format!("0x{port_addr:x}"));

        Self {
            mem: Arc::new(Mutex::new(region)),
            port_addr,
            sink: Mutex::new(sink),
            params,
            signals: Mutex::new(BTreeMap::new()),
            events: Mutex::new(Vec::new()),
            now_ps: AtomicU64::new(0),
            syscalls: AtomicU64::new(0),
            mailboxes: Mutex::new(Vec::new()),
        }
    }

    /// Address of the memory-mapped output port.
    #[must_use]
    pub const fn port_addr(&self) -> u64 {
        self.port_addr
    }

    /// Usable size of the wrapped region.
    #[must_use]
    pub fn memory_size(&self) -> u64 {
        relock(&self.mem).size()
    }

    /// Registers a mailbox for one core thread.
    #[must_use]
    pub fn subscribe(&self) -> Arc<CoreMailbox> {
        let mailbox = Arc::new(CoreMailbox::default());
        relock(&self.mailboxes).push(Arc::clone(&mailbox));
        mailbox
    }

    /// Advances virtual time by `ps` picoseconds.
    pub fn advance_time(&self, ps: u64) {
        self.now_ps.fetch_add(ps, Ordering::Relaxed);
    }

    /// Leaps virtual time forward to the earliest scheduled event, if any
    /// is in the future; returns `true` when time moved.
    pub fn advance_time_to_next_event(&self) -> bool {
        let earliest = relock(&self.events).iter().map(|event| event.due_ps).min();
        let Some(due) = earliest else {
            return false;
        };
        let now = self.now_ps.load(Ordering::Relaxed);
        if due > now {
            self.now_ps.store(due, Ordering::Relaxed);
        }
        true
    }

    /// Moves due events into every registered mailbox.
    pub fn pump_events(&self) {
        let now = self.now_ps.load(Ordering::Relaxed);
        let mut due = Vec::new();
        relock(&self.events).retain(|event| {
            if event.due_ps <= now {
                due.push(event.id);
                false
            } else {
                true
            }
        });
        if due.is_empty() {
            return;
        }
        for mailbox in relock(&self.mailboxes).iter() {
            relock(&mailbox.events).extend(due.iter().copied());
        }
    }

    /// Returns `true` when no events remain scheduled.
    #[must_use]
    pub fn no_events_pending(&self) -> bool {
        relock(&self.events).is_empty()
    }

    /// Latched level of a signal line, if it was ever driven.
    #[must_use]
    pub fn signal_state(&self, sigid: u64) -> Option<bool> {
        relock(&self.signals).get(&sigid).copied()
    }

    /// Number of syscalls broadcast through this environment.
    #[must_use]
    pub fn syscalls_broadcast(&self) -> u64 {
        self.syscalls.load(Ordering::Relaxed)
    }

    fn page_in_region(&self, page_addr: u64) -> bool {
        page_addr % PAGE_SIZE == 0
            && page_addr
                .checked_add(PAGE_SIZE)
                .is_some_and(|end| end <= relock(&self.mem).size())
    }

    fn is_port_page(&self, page_addr: u64) -> bool {
        page_base(self.port_addr) == page_addr
    }

    fn port_transact(&self, tx: &mut Transaction<'_>) -> Response {
        // The port device is write-only and word-sized.
        if tx.is_read || tx.size() != 4 {
            return Response::Failed;
        }
        let byte = tx.data[0];
        let mut sink = relock(&self.sink);
        if sink.write_all(&[byte]).and_then(|()| sink.flush()).is_err() {
            return Response::CommandError;
        }
        Response::Ok
    }

    fn push_invalidation(&self, start: u64, end: u64) {
        for mailbox in relock(&self.mailboxes).iter() {
            relock(&mailbox.invalidations).push((start, end));
        }
    }
}

impl Environment for RunnerEnv {
    fn page_for_read(&self, page_addr: u64) -> Option<Arc<dyn DirectPage>> {
        if !self.page_in_region(page_addr) || self.is_port_page(page_addr) {
            return None;
        }
        Some(Arc::new(RegionPage {
            mem: Arc::clone(&self.mem),
            page_addr,
            writable: false,
        }))
    }

    fn page_for_write(&self, page_addr: u64) -> Option<Arc<dyn DirectPage>> {
        if !self.page_in_region(page_addr) || self.is_port_page(page_addr) {
            return None;
        }
        if relock(&self.mem).page_is_protected(page_addr) {
            return None;
        }
        Some(Arc::new(RegionPage {
            mem: Arc::clone(&self.mem),
            page_addr,
            writable: true,
        }))
    }

    fn transport(&self, tx: &mut Transaction<'_>) -> Response {
        if tx.addr == self.port_addr {
            return self.port_transact(tx);
        }

        let mut mem = relock(&self.mem);
        if !tx.is_read && !tx.is_debug {
            let hit = mem.protected_pages_in(tx.addr, tx.size());
            if !hit.is_empty() {
                // Self-modifying code: lift protection, tell every core to
                // drop translations for those pages, then let the write
                // land.
                for page in &hit {
                    mem.unprotect_page(*page);
                }
                drop(mem);
                for page in hit {
                    self.push_invalidation(page, page + PAGE_SIZE - 1);
                }
                mem = relock(&self.mem);
            }
        }
        mem.transact(tx)
    }

    fn protect_page(&self, page_addr: u64) {
        relock(&self.mem).protect_page(page_addr);
    }

    fn signal(&self, sigid: u64, set: bool) {
        relock(&self.signals).insert(sigid, set);
    }

    fn broadcast_syscall(&self, _callno: i32, _arg: Arc<dyn Any + Send + Sync>, _async_call: bool) {
        self.syscalls.fetch_add(1, Ordering::Relaxed);
    }

    fn time_ps(&self) -> u64 {
        self.now_ps.load(Ordering::Relaxed)
    }

    fn param(&self, name: &str) -> Option<String> {
        self.params.get(name).cloned()
    }

    fn notify(&self, event_id: u64, time_ps: u64) {
        relock(&self.events).push(ScheduledEvent {
            id: event_id,
            due_ps: time_ps,
        });
    }

    fn cancel(&self, event_id: u64) {
        relock(&self.events).retain(|event| event.id != event_id);
    }

    // The runner carries no debugger front end: any breakpoint or
    // watchpoint that fires halts the core that hit it.
    fn breakpoint_hit(&self, _vaddr: u64) -> bool {
        true
    }

    fn watchpoint_hit(&self, _vaddr: u64, _len: u64, _data: u64, _is_write: bool) -> bool {
        true
    }
}
