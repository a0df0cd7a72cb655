//! Reference core model for the cpulink protocol.
//!
//! Implements the plugin side of the protocol for the `mini` architecture
//! family: a register file, breakpoint and watchpoint sets, page and
//! translation caches fed by the environment's fast path, and a
//! block-granular stepping loop with cooperative cancellation. The
//! instruction set is deliberately miniature; it exists so conformance
//! suites and demo images have something real to step.

/// Fixed-width instruction encodings.
pub mod isa;
pub use isa::{
    decode, encode_halt, encode_jmp, encode_ldr, encode_movi, encode_nop, encode_out, encode_str,
    MiniInsn, INSN_BYTES,
};

/// Architectural register file.
pub mod regs;
pub use regs::{RegisterFile, GPR_COUNT, NUM_REGS, PC_REGID, REG_NAMES, SP_REGID};

/// Textual instruction formatting.
pub mod disasm;
pub use disasm::format_insn;

mod cache;

/// The core model and its stepping loop.
pub mod core;
pub use self::core::{MiniCore, BLOCK_INSNS, DEFAULT_PORT_ADDR};

/// Variants and the core factory.
pub mod factory;
pub use factory::{MiniCoreFactory, UnknownVariant, Variant, PROVIDER, VARIANT_NAMES};

#[cfg(test)]
use rstest as _;
