//! Architecturally visible register file for the miniature core.

/// Number of architecturally visible registers (`r0..r15`, `sp`, `pc`).
pub const NUM_REGS: u64 = 18;
/// Register id of the stack pointer.
pub const SP_REGID: u64 = 16;
/// Register id of the program counter.
pub const PC_REGID: u64 = 17;
/// Number of general-purpose registers addressable by instructions.
pub const GPR_COUNT: usize = 16;

/// Canonical register names, indexed by register id.
pub const REG_NAMES: [&str; NUM_REGS as usize] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "sp", "pc",
];

/// Register file with a variant-selected register width (4 or 8 bytes).
///
/// Values are stored zero-extended to 64 bits and masked to the declared
/// width on every write, so byte-level reads never observe bits outside the
/// architectural width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    regs: [u64; NUM_REGS as usize],
    width: usize,
}

impl RegisterFile {
    /// Creates a zeroed register file with `width`-byte registers.
    #[must_use]
    pub const fn new(width: usize) -> Self {
        Self {
            regs: [0; NUM_REGS as usize],
            width,
        }
    }

    /// Register width in bytes.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    const fn mask(&self) -> u64 {
        if self.width >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.width * 8)) - 1
        }
    }

    /// Reads a register by id, or `None` when `regid` is out of range.
    #[must_use]
    pub fn get(&self, regid: u64) -> Option<u64> {
        usize::try_from(regid)
            .ok()
            .and_then(|id| self.regs.get(id))
            .copied()
    }

    /// Writes a register by id; returns `false` when out of range.
    pub fn set(&mut self, regid: u64, value: u64) -> bool {
        let mask = self.mask();
        let Some(slot) = usize::try_from(regid)
            .ok()
            .and_then(|id| self.regs.get_mut(id))
        else {
            return false;
        };
        *slot = value & mask;
        true
    }

    /// Reads a general-purpose register by instruction field index.
    #[must_use]
    pub const fn gpr(&self, idx: u8) -> u64 {
        self.regs[idx as usize]
    }

    /// Writes a general-purpose register by instruction field index.
    pub const fn set_gpr(&mut self, idx: u8, value: u64) {
        self.regs[idx as usize] = value & self.mask();
    }

    /// Reads the program counter.
    #[must_use]
    pub const fn pc(&self) -> u64 {
        self.regs[PC_REGID as usize]
    }

    /// Writes the program counter.
    pub const fn set_pc(&mut self, value: u64) {
        self.regs[PC_REGID as usize] = value & self.mask();
    }

    /// Reads the stack pointer.
    #[must_use]
    pub const fn sp(&self) -> u64 {
        self.regs[SP_REGID as usize]
    }

    /// Writes the stack pointer.
    pub const fn set_sp(&mut self, value: u64) {
        self.regs[SP_REGID as usize] = value & self.mask();
    }

    /// Canonical name for a register id.
    #[must_use]
    pub fn name(regid: u64) -> Option<&'static str> {
        usize::try_from(regid)
            .ok()
            .and_then(|id| REG_NAMES.get(id))
            .copied()
    }

    /// Copies a register into `buf` as little-endian bytes.
    ///
    /// Returns `false` without side effects when `regid` is out of range or
    /// `buf` is not exactly the register width.
    pub fn read_bytes(&self, regid: u64, buf: &mut [u8]) -> bool {
        if buf.len() != self.width {
            return false;
        }
        let Some(value) = self.get(regid) else {
            return false;
        };
        buf.copy_from_slice(&value.to_le_bytes()[..self.width]);
        true
    }

    /// Writes a register from little-endian `buf`.
    ///
    /// Same failure contract as [`Self::read_bytes`].
    pub fn write_bytes(&mut self, regid: u64, buf: &[u8]) -> bool {
        if buf.len() != self.width {
            return false;
        }
        let mut bytes = [0u8; 8];
        bytes[..self.width].copy_from_slice(buf);
        self.set(regid, u64::from_le_bytes(bytes))
    }

    /// Zeroes every register.
    pub fn reset(&mut self) {
        self.regs = [0; NUM_REGS as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::{RegisterFile, GPR_COUNT, NUM_REGS, PC_REGID, REG_NAMES, SP_REGID};
    use std::collections::BTreeSet;

    #[test]
    fn pc_and_sp_ids_are_distinct_and_in_range() {
        assert_ne!(PC_REGID, SP_REGID);
        assert!(PC_REGID < NUM_REGS);
        assert!(SP_REGID < NUM_REGS);
        assert!(GPR_COUNT as u64 <= NUM_REGS);
    }

    #[test]
    fn register_names_are_pairwise_distinct() {
        let unique: BTreeSet<&str> = REG_NAMES.iter().copied().collect();
        assert_eq!(unique.len(), REG_NAMES.len());
    }

    #[test]
    fn registers_track_values_independently() {
        let mut regs = RegisterFile::new(4);
        for id in 0..NUM_REGS {
            assert!(regs.set(id, 0x1000 + id));
        }
        for id in 0..NUM_REGS {
            assert_eq!(regs.get(id), Some(0x1000 + id));
        }
    }

    #[test]
    fn width_masks_writes() {
        let mut regs = RegisterFile::new(4);
        assert!(regs.set(0, u64::MAX));
        assert_eq!(regs.get(0), Some(0xFFFF_FFFF));

        let mut wide = RegisterFile::new(8);
        assert!(wide.set(0, u64::MAX));
        assert_eq!(wide.get(0), Some(u64::MAX));
    }

    #[test]
    fn out_of_range_ids_fail_without_side_effects() {
        let mut regs = RegisterFile::new(4);
        assert_eq!(regs.get(NUM_REGS), None);
        assert!(!regs.set(NUM_REGS, 1));
        assert_eq!(RegisterFile::name(NUM_REGS), None);

        let mut buf = [0u8; 4];
        assert!(!regs.read_bytes(NUM_REGS, &mut buf));
        assert!(!regs.write_bytes(NUM_REGS, &buf));
    }

    #[test]
    fn byte_round_trip_is_little_endian() {
        let mut regs = RegisterFile::new(4);
        assert!(regs.write_bytes(3, &[0x78, 0x56, 0x34, 0x12]));
        assert_eq!(regs.get(3), Some(0x1234_5678));

        let mut buf = [0u8; 4];
        assert!(regs.read_bytes(3, &mut buf));
        assert_eq!(buf, [0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn mis_sized_buffers_are_rejected() {
        let mut regs = RegisterFile::new(8);
        let mut short = [0u8; 4];
        assert!(!regs.read_bytes(0, &mut short));
        assert!(!regs.write_bytes(0, &short));
    }

    #[test]
    fn reset_zeroes_all_registers() {
        let mut regs = RegisterFile::new(4);
        regs.set_pc(0x100);
        regs.set_sp(0x200);
        assert!(regs.set(5, 42));

        regs.reset();
        for id in 0..NUM_REGS {
            assert_eq!(regs.get(id), Some(0));
        }
    }
}
