//! Drives core models concurrently with quantum/overshoot accounting.
//!
//! One OS thread per core; `step` runs synchronously on its thread and is
//! the only call expected to block. Stop requests go through each core's
//! [`StopToken`], which the stepping loop polls at block granularity, so
//! `stop_all` followed by `join` returns promptly.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpulink_protocol::{CoreModel, RunState, StopToken};

use crate::env::RunnerEnv;

/// Virtual picoseconds charged per executed instruction.
pub const PS_PER_INSN: u64 = 1_000;

/// Final accounting for one core thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRunReport {
    /// Index of the core in launch order.
    pub core_index: usize,
    /// Instructions executed over the core's lifetime.
    pub instructions: u64,
    /// Execution state the core ended in.
    pub state: RunState,
}

/// One thread per core, joined on shutdown.
pub struct Scheduler {
    threads: Vec<JoinHandle<CoreRunReport>>,
    stops: Vec<StopToken>,
}

impl Scheduler {
    /// Seeds each core's program counter with `reset_pc`, assigns core
    /// ids, and launches one thread per core.
    #[must_use]
    pub fn launch(
        env: &Arc<RunnerEnv>,
        cores: Vec<Box<dyn CoreModel>>,
        quantum: u64,
        reset_pc: u64,
    ) -> Self {
        let quantum = quantum.max(1);
        let mut threads = Vec::with_capacity(cores.len());
        let mut stops = Vec::with_capacity(cores.len());

        for (index, mut core) in cores.into_iter().enumerate() {
            core.set_id(0, index as u64);
            seed_pc(core.as_mut(), reset_pc);
            stops.push(core.stop_token());

            let env = Arc::clone(env);
            threads.push(thread::spawn(move || run_core(core, &env, quantum, index)));
        }

        Self { threads, stops }
    }

    /// Requests every core to stop at its next poll point.
    pub fn stop_all(&self) {
        for stop in &self.stops {
            stop.request_stop();
        }
    }

    /// Waits for every core thread and collects its report.
    #[must_use]
    pub fn join(self) -> Vec<CoreRunReport> {
        self.threads
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(report) => report,
                Err(_) => CoreRunReport {
                    core_index: usize::MAX,
                    instructions: 0,
                    state: RunState::Stopped,
                },
            })
            .collect()
    }
}

fn seed_pc(core: &mut dyn CoreModel, reset_pc: u64) {
    let pc_regid = core.pc_regid();
    let width = core.reg_size(pc_regid);
    let bytes = reset_pc.to_le_bytes();
    if width <= bytes.len() {
        core.write_reg(pc_regid, &bytes[..width]);
    }
}

fn run_core(
    mut core: Box<dyn CoreModel>,
    env: &Arc<RunnerEnv>,
    quantum: u64,
    index: usize,
) -> CoreRunReport {
    let mailbox = env.subscribe();
    let mut overshoot: u64 = 0;
    let mut idle_rounds: u32 = 0;

    loop {
        // Stale-translation notices and due events are applied at quantum
        // boundaries; a core never mutates itself from a foreign thread.
        for (start, end) in mailbox.drain_invalidations() {
            core.tb_flush_page(start, end);
            core.invalidate_page_ptr(start);
        }
        for event in mailbox.drain_events() {
            core.notified(event);
        }

        if overshoot >= quantum {
            overshoot -= quantum;
            continue;
        }

        let before = core.insn_count();
        overshoot = core.step(quantum - overshoot);
        let executed = core.insn_count().saturating_sub(before);

        env.advance_time(executed.saturating_mul(PS_PER_INSN));
        env.pump_events();

        if core.run_state().is_terminal() {
            break;
        }

        if executed == 0 {
            idle_rounds += 1;
            // A wait-state core with events still scheduled leaps virtual
            // time forward; with nothing scheduled the machine is done.
            if env.advance_time_to_next_event() {
                env.pump_events();
            } else if idle_rounds >= 2 {
                break;
            }
            thread::yield_now();
        } else {
            idle_rounds = 0;
        }
    }

    CoreRunReport {
        core_index: index,
        instructions: core.insn_count(),
        state: core.run_state(),
    }
}
