//! The plugin-side core model contract and its control primitives.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Host-observable execution state of one core model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RunState {
    /// Constructed or reset; no stepping has happened yet.
    #[default]
    Idle,
    /// Currently inside a [`CoreModel::step`] call.
    Stepping,
    /// Returned from `step`: quantum exhausted, wait state entered, or a
    /// blocking breakpoint/watchpoint fired.
    Halted,
    /// A stop request was honored; terminal until [`CoreModel::reset`].
    Stopped,
}

impl RunState {
    /// Returns `true` when only `reset` can resume execution.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Cloneable cooperative-cancellation handle for an in-flight `step`.
///
/// A core polls its token at a bounded granularity (per executed block), so
/// a stop request from another thread returns the `step` call promptly
/// instead of letting it run out an unbounded quantum.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    /// Creates a token with no stop requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests that the owning core stop at its next poll point.
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    /// Returns `true` when a stop has been requested and not yet cleared.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Clears a pending stop request (part of `reset` semantics).
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// A pluggable CPU-core model bound to one [`crate::Environment`] for its
/// whole lifetime.
///
/// Within one core all calls are strictly sequential; the host never calls
/// into the same core concurrently. Register files and breakpoint and
/// watchpoint sets are exclusively owned by their core.
pub trait CoreModel: Send {
    /// Name of the module that built this core.
    fn provider(&self) -> &str;

    /// Architecture name of the modeled core.
    fn arch(&self) -> &str;

    /// Architecture name in GDB nomenclature.
    fn arch_gdb(&self) -> &str;

    /// Architecture family the variant belongs to.
    fn arch_family(&self) -> &str;

    /// Page size of the modeled address space; a nonzero power of two.
    fn page_size(&self) -> u64;

    /// Assigns processor/core identifiers used in diagnostics.
    fn set_id(&mut self, procid: u64, coreid: u64);

    /// Executes instructions until at least `num_insn` have run, then
    /// returns the overshoot (`executed - num_insn`, saturated at zero).
    ///
    /// The unit of execution is a block, so the boundary may be overrun. A
    /// blocking breakpoint/watchpoint verdict or a stop request ends the
    /// call early; callers must not assume exact accounting and can recover
    /// precise counts through [`Self::insn_count`].
    fn step(&mut self, num_insn: u64) -> u64;

    /// Returns a clone of the cancellation token polled by `step`.
    fn stop_token(&self) -> StopToken;

    /// Total instructions executed since construction or the last `reset`.
    fn insn_count(&self) -> u64;

    /// Current host-observable execution state.
    fn run_state(&self) -> RunState;

    /// Returns to [`RunState::Idle`], clearing the instruction counter and
    /// any stop request. Breakpoint and watchpoint sets persist.
    fn reset(&mut self);

    /// Drives an interrupt line; raising a line wakes a wait-for-interrupt
    /// halt.
    fn interrupt(&mut self, irq: u64, set: bool);

    /// Delivers an event previously scheduled through
    /// [`crate::Environment::notify`].
    fn notified(&mut self, event_id: u64);

    /// Receives one syscall fanned out by
    /// [`crate::Environment::broadcast_syscall`].
    fn handle_syscall(&mut self, callno: i32, arg: Arc<dyn Any + Send + Sync>);

    /// Register id of the program counter; distinct from [`Self::sp_regid`]
    /// and `< num_regs()`.
    fn pc_regid(&self) -> u64;

    /// Register id of the stack pointer.
    fn sp_regid(&self) -> u64;

    /// Number of architecturally visible registers.
    fn num_regs(&self) -> u64;

    /// Width in bytes of register `regid`, or 0 when out of range.
    fn reg_size(&self, regid: u64) -> usize;

    /// Name of register `regid`; names are pairwise distinct.
    fn reg_name(&self, regid: u64) -> Option<&str>;

    /// Copies exactly `reg_size(regid)` bytes of register state into `buf`.
    ///
    /// Returns `false` without side effects when `regid` is out of range,
    /// inaccessible, or `buf` is not exactly `reg_size(regid)` bytes.
    fn read_reg(&mut self, regid: u64, buf: &mut [u8]) -> bool;

    /// Copies exactly `reg_size(regid)` bytes from `buf` into the register.
    ///
    /// Same failure contract as [`Self::read_reg`].
    fn write_reg(&mut self, regid: u64, buf: &[u8]) -> bool;

    /// Adds `vaddr` to the breakpoint set; returns whether the set changed.
    /// Misaligned addresses are rejected on architectures with instruction
    /// alignment constraints.
    fn add_breakpoint(&mut self, vaddr: u64) -> bool;

    /// Removes `vaddr` from the breakpoint set; returns whether the set
    /// changed.
    fn remove_breakpoint(&mut self, vaddr: u64) -> bool;

    /// Registers a watch range; `is_write` selects store watches over load
    /// watches. Returns whether the set changed.
    fn add_watchpoint(&mut self, vaddr: u64, len: u64, is_write: bool) -> bool;

    /// Unregisters a watch range; returns whether the set changed.
    fn remove_watchpoint(&mut self, vaddr: u64, len: u64, is_write: bool) -> bool;

    /// Enables/disables basic-block begin notifications; returns whether
    /// the core supports them.
    fn trace_basic_blocks(&mut self, on: bool) -> bool;

    /// Translates a virtual to a physical address, or `None` when no
    /// mapping exists.
    fn virt_to_phys(&mut self, vaddr: u64) -> Option<u64>;

    /// Appends the textual form of the instruction at `addr` to `out`,
    /// truncated to `max_chars` characters; returns the bytes consumed, or
    /// 0 on failure.
    fn disassemble(&mut self, addr: u64, out: &mut String, max_chars: usize) -> u64;

    /// Drops any cached fast-path handle for the page at `page_addr`.
    fn invalidate_page_ptr(&mut self, page_addr: u64);

    /// Drops every cached fast-path handle.
    fn invalidate_page_ptrs(&mut self);

    /// Drops all cached translations.
    fn tb_flush(&mut self);

    /// Drops cached translations overlapping `[start, end]`.
    fn tb_flush_page(&mut self, start: u64, end: u64);
}

#[cfg(test)]
mod tests {
    use super::{RunState, StopToken};

    #[test]
    fn run_state_default_is_idle() {
        assert_eq!(RunState::default(), RunState::Idle);
    }

    #[test]
    fn only_stopped_is_terminal() {
        assert!(RunState::Stopped.is_terminal());
        assert!(!RunState::Idle.is_terminal());
        assert!(!RunState::Stepping.is_terminal());
        assert!(!RunState::Halted.is_terminal());
    }

    #[test]
    fn stop_token_round_trip() {
        let token = StopToken::new();
        assert!(!token.is_stop_requested());

        token.request_stop();
        assert!(token.is_stop_requested());

        token.clear();
        assert!(!token.is_stop_requested());
    }

    #[test]
    fn stop_token_clones_share_state() {
        let token = StopToken::new();
        let seen_by_core = token.clone();

        token.request_stop();
        assert!(seen_by_core.is_stop_requested());

        seen_by_core.clear();
        assert!(!token.is_stop_requested());
    }

    #[test]
    fn stop_token_is_visible_across_threads() {
        let token = StopToken::new();
        let remote = token.clone();

        let handle = std::thread::spawn(move || {
            remote.request_stop();
        });
        handle.join().expect("stop thread must not panic");

        assert!(token.is_stop_requested());
    }
}
