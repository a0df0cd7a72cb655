//! The host-side capability surface a core model calls into.

use std::any::Any;
use std::sync::Arc;

use crate::{HintKind, Response, Transaction};

/// Shared handle to one directly mappable page.
///
/// A `DirectPage` is the fast path: a core may cache the handle and access
/// the page repeatedly without a transaction per access. Handles are
/// internally synchronized and remain safe to use after invalidation; a
/// stale or refused access reports `false` and the core must fall back to
/// [`Environment::transport`].
pub trait DirectPage: Send + Sync {
    /// Copies `buf.len()` bytes from `offset` within the page into `buf`.
    ///
    /// Returns `false` when the access does not fit in the page or the
    /// backing store refused it.
    fn read(&self, offset: usize, buf: &mut [u8]) -> bool;

    /// Copies `buf` to `offset` within the page.
    ///
    /// Returns `false` when the access does not fit, the handle is
    /// read-only, or the page is write-protected; the caller must then
    /// retry through the transactional slow path.
    fn write(&self, offset: usize, buf: &[u8]) -> bool;
}

/// The capability surface the host exposes to every core bound to it.
///
/// One environment instance may be shared by several concurrently stepping
/// cores; every method takes `&self` and implementations must be internally
/// synchronized. An implementation must document its locking discipline
/// (one global memory-engine lock, or per-page locking).
pub trait Environment: Send + Sync {
    /// Returns a readable fast-path handle for the page at `page_addr`, or
    /// `None` when the address is not eligible for direct mapping (out of
    /// range, or device space that demands transactions).
    fn page_for_read(&self, page_addr: u64) -> Option<Arc<dyn DirectPage>>;

    /// Returns a writable fast-path handle for the page at `page_addr`, or
    /// `None` when direct writes are not allowed there (device space,
    /// write-protected pages, out of range).
    fn page_for_write(&self, page_addr: u64) -> Option<Arc<dyn DirectPage>>;

    /// Transactional slow path; always usable as a correctness fallback.
    fn transport(&self, tx: &mut Transaction<'_>) -> Response;

    /// Core notification that it holds cached translations for the page at
    /// `page_addr`; the host must flag subsequent writes to it.
    fn protect_page(&self, page_addr: u64) {
        let _ = page_addr;
    }

    /// Drives a level signal (interrupt line, reset line) up or down.
    fn signal(&self, sigid: u64, set: bool) {
        let _ = (sigid, set);
    }

    /// Forwards a guest syscall to every core bound to this environment.
    fn broadcast_syscall(&self, callno: i32, arg: Arc<dyn Any + Send + Sync>, async_call: bool) {
        let _ = (callno, arg, async_call);
    }

    /// Current simulation time in picoseconds.
    fn time_ps(&self) -> u64 {
        0
    }

    /// Looks up a named configuration parameter.
    fn param(&self, name: &str) -> Option<String> {
        let _ = name;
        None
    }

    /// Schedules delivery of `event_id` back to the requesting core at
    /// `time_ps` via [`crate::CoreModel::notified`].
    fn notify(&self, event_id: u64, time_ps: u64) {
        let _ = (event_id, time_ps);
    }

    /// Cancels a previously scheduled event.
    fn cancel(&self, event_id: u64) {
        let _ = event_id;
    }

    /// Advisory execution hint; never alters control flow.
    fn hint(&self, kind: HintKind) {
        let _ = kind;
    }

    /// Advisory notification that execution entered a basic block at
    /// `vaddr`; never alters control flow.
    fn begin_basic_block(&self, vaddr: u64) {
        let _ = vaddr;
    }

    /// Called when the core reaches an address in its breakpoint set.
    ///
    /// Returning `true` halts stepping immediately with the program counter
    /// left at `vaddr`; returning `false` continues past the breakpoint.
    fn breakpoint_hit(&self, vaddr: u64) -> bool {
        let _ = vaddr;
        false
    }

    /// Called when a data access overlaps a registered watch range.
    ///
    /// `data` carries the value involved in the access. Returning `true`
    /// halts stepping immediately with the program counter left at the
    /// accessing instruction and the access not committed.
    fn watchpoint_hit(&self, vaddr: u64, len: u64, data: u64, is_write: bool) -> bool {
        let _ = (vaddr, len, data, is_write);
        false
    }
}
