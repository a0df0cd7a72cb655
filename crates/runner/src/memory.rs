//! The memory transaction engine: one contiguous, aligned backing store
//! with bounds-checked transactional access and page-granular write
//! protection.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use cpulink_protocol::{page_base, Response, Transaction, PAGE_SIZE};

/// Fatal configuration errors raised while building or loading a region.
///
/// These indicate a misconfigured run, not a transient condition; the CLI
/// reports them and exits.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The region size was zero.
    #[error("memory size must be nonzero")]
    ZeroSize,
    /// The alignment was zero or not a power of two.
    #[error("invalid alignment {alignment:#x}: must be a nonzero power of two")]
    BadAlignment {
        /// The rejected alignment value.
        alignment: u64,
    },
    /// The reservation did not fit in the host address space.
    #[error("unable to reserve {size} bytes of memory")]
    ReservationFailed {
        /// Requested usable size in bytes.
        size: u64,
    },
    /// The image file could not be read.
    #[error("unable to read image {path}: {source}")]
    ImageUnreadable {
        /// Path of the rejected image.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The image file does not fit in the region.
    #[error("image {path} is {image_size} bytes but the region holds only {region_size}")]
    ImageTooLarge {
        /// Path of the rejected image.
        path: PathBuf,
        /// Size of the image file in bytes.
        image_size: u64,
        /// Usable region size in bytes.
        region_size: u64,
    },
}

/// A contiguous region of simulated memory.
///
/// The region owns exactly one backing allocation, over-reserved by the
/// requested alignment so the usable base can be aligned inside it;
/// dropping the region releases the whole reservation (padding included)
/// exactly once. Valid addresses are `[0, size)` and `size` is fixed at
/// construction.
#[derive(Debug)]
pub struct MemoryRegion {
    buf: Vec<u8>,
    base: usize,
    size: u64,
    protected: Vec<bool>,
}

impl MemoryRegion {
    /// Reserves `size` usable bytes whose base is aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Returns a [`MemoryError`] when the parameters are invalid or the
    /// reservation cannot be satisfied; both are fatal configuration
    /// errors at this layer.
    pub fn new(size: u64, alignment: u64) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(MemoryError::BadAlignment { alignment });
        }

        let total = size
            .checked_add(alignment)
            .and_then(|total| usize::try_from(total).ok())
            .ok_or(MemoryError::ReservationFailed { size })?;

        let mut buf = Vec::new();
        buf.try_reserve_exact(total)
            .map_err(|_| MemoryError::ReservationFailed { size })?;
        buf.resize(total, 0);

        let addr = buf.as_ptr() as usize;
        let align = alignment as usize;
        let base = addr.next_multiple_of(align) - addr;

        let pages = usize::try_from(size.div_ceil(PAGE_SIZE))
            .map_err(|_| MemoryError::ReservationFailed { size })?;

        Ok(Self {
            buf,
            base,
            size,
            protected: vec![false; pages],
        })
    }

    /// Usable size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Copies the file at `path` verbatim to offset 0.
    ///
    /// # Errors
    ///
    /// Returns a [`MemoryError`] when the file is unreadable or larger
    /// than the region.
    pub fn load(&mut self, path: &Path) -> Result<u64, MemoryError> {
        let image = fs::read(path).map_err(|source| MemoryError::ImageUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let image_size = image.len() as u64;
        if image_size > self.size {
            return Err(MemoryError::ImageTooLarge {
                path: path.to_path_buf(),
                image_size,
                region_size: self.size,
            });
        }

        self.slice_mut()[..image.len()].copy_from_slice(&image);
        Ok(image_size)
    }

    fn slice(&self) -> &[u8] {
        let end = self.base + self.size as usize;
        &self.buf[self.base..end]
    }

    fn slice_mut(&mut self) -> &mut [u8] {
        let end = self.base + self.size as usize;
        &mut self.buf[self.base..end]
    }

    fn range_of(&self, addr: u64, len: u64) -> Option<(usize, usize)> {
        let end = addr.checked_add(len)?;
        if end > self.size {
            return None;
        }
        let start = usize::try_from(addr).ok()?;
        let end = usize::try_from(end).ok()?;
        Some((start, end))
    }

    /// Executes one transaction against the region.
    ///
    /// Any access whose last byte would land at or beyond the region's end
    /// fails without touching memory; the valid range is `[0, size)`.
    /// Non-debug writes overlapping a protected page fail likewise; the
    /// environment resolves the protection before retrying.
    pub fn transact(&mut self, tx: &mut Transaction<'_>) -> Response {
        let Some((start, end)) = self.range_of(tx.addr, tx.size()) else {
            return Response::Failed;
        };

        if tx.is_read {
            tx.data.copy_from_slice(&self.slice()[start..end]);
        } else {
            if !tx.is_debug && self.protected_overlap(tx.addr, tx.size()) {
                return Response::Failed;
            }
            self.slice_mut()[start..end].copy_from_slice(tx.data);
        }
        Response::Ok
    }

    /// Copies bytes out of the region; `false` when out of range.
    pub fn read_at(&self, addr: u64, buf: &mut [u8]) -> bool {
        match self.range_of(addr, buf.len() as u64) {
            Some((start, end)) => {
                buf.copy_from_slice(&self.slice()[start..end]);
                true
            }
            None => false,
        }
    }

    /// Copies bytes into the region, honoring page protection; `false`
    /// when out of range or protected.
    pub fn write_at(&mut self, addr: u64, buf: &[u8]) -> bool {
        if self.protected_overlap(addr, buf.len() as u64) {
            return false;
        }
        match self.range_of(addr, buf.len() as u64) {
            Some((start, end)) => {
                self.slice_mut()[start..end].copy_from_slice(buf);
                true
            }
            None => false,
        }
    }

    fn page_index(&self, page_addr: u64) -> Option<usize> {
        if page_addr >= self.size {
            return None;
        }
        usize::try_from(page_addr / PAGE_SIZE).ok()
    }

    /// Marks the page containing `page_addr` read-only.
    pub fn protect_page(&mut self, page_addr: u64) {
        if let Some(index) = self.page_index(page_base(page_addr)) {
            self.protected[index] = true;
        }
    }

    /// Lifts write protection from the page containing `page_addr`.
    pub fn unprotect_page(&mut self, page_addr: u64) {
        if let Some(index) = self.page_index(page_base(page_addr)) {
            self.protected[index] = false;
        }
    }

    /// Returns `true` when the page containing `page_addr` is read-only.
    #[must_use]
    pub fn page_is_protected(&self, page_addr: u64) -> bool {
        self.page_index(page_base(page_addr))
            .is_some_and(|index| self.protected[index])
    }

    /// Returns `true` when `[addr, addr + len)` overlaps a protected page.
    #[must_use]
    pub fn protected_overlap(&self, addr: u64, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        let first = page_base(addr);
        let last = page_base(addr.saturating_add(len - 1));
        let mut page = first;
        loop {
            if self.page_is_protected(page) {
                return true;
            }
            if page >= last {
                return false;
            }
            page += PAGE_SIZE;
        }
    }

    /// Pages in `[addr, addr + len)` that are currently protected.
    #[must_use]
    pub fn protected_pages_in(&self, addr: u64, len: u64) -> Vec<u64> {
        let mut pages = Vec::new();
        if len == 0 {
            return pages;
        }
        let first = page_base(addr);
        let last = page_base(addr.saturating_add(len - 1));
        let mut page = first;
        loop {
            if self.page_is_protected(page) {
                pages.push(page);
            }
            if page >= last {
                return pages;
            }
            page += PAGE_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MemoryError, MemoryRegion};
    use cpulink_protocol::{Response, Transaction, PAGE_SIZE};

    fn region(size: u64) -> MemoryRegion {
        MemoryRegion::new(size, PAGE_SIZE).expect("test region must allocate")
    }

    #[test]
    fn usable_base_is_aligned() {
        for alignment in [16u64, 4096, 1 << 16] {
            let region = MemoryRegion::new(PAGE_SIZE, alignment).expect("region allocates");
            let base_addr = region.buf.as_ptr() as usize + region.base;
            assert_eq!(base_addr % alignment as usize, 0);
        }
    }

    #[test]
    fn invalid_parameters_are_fatal_configuration_errors() {
        assert!(matches!(
            MemoryRegion::new(0, PAGE_SIZE),
            Err(MemoryError::ZeroSize)
        ));
        assert!(matches!(
            MemoryRegion::new(PAGE_SIZE, 0),
            Err(MemoryError::BadAlignment { alignment: 0 })
        ));
        assert!(matches!(
            MemoryRegion::new(PAGE_SIZE, 48),
            Err(MemoryError::BadAlignment { alignment: 48 })
        ));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut region = region(PAGE_SIZE * 2);
        let mut payload = *b"transactional";
        let mut tx = Transaction::write(0x100, &mut payload);
        assert_eq!(region.transact(&mut tx), Response::Ok);

        let mut readback = [0u8; 13];
        let mut tx = Transaction::read(0x100, &mut readback);
        assert_eq!(region.transact(&mut tx), Response::Ok);
        assert_eq!(&readback, b"transactional");
    }

    #[test]
    fn last_byte_is_accessible_and_one_past_is_not() {
        let mut region = region(PAGE_SIZE);

        let mut one = [0xAAu8];
        let mut tx = Transaction::write(PAGE_SIZE - 1, &mut one);
        assert_eq!(region.transact(&mut tx), Response::Ok);

        let mut one = [0u8];
        let mut tx = Transaction::read(PAGE_SIZE - 1, &mut one);
        assert_eq!(region.transact(&mut tx), Response::Ok);
        assert_eq!(one[0], 0xAA);

        let mut two = [0u8; 2];
        let mut tx = Transaction::write(PAGE_SIZE - 1, &mut two);
        assert_eq!(region.transact(&mut tx), Response::Failed);

        let mut one = [0u8];
        let mut tx = Transaction::read(PAGE_SIZE, &mut one);
        assert_eq!(region.transact(&mut tx), Response::Failed);
    }

    #[test]
    fn rejected_transactions_leave_memory_untouched() {
        let mut region = region(PAGE_SIZE);
        let mut fill = vec![0x5Au8; PAGE_SIZE as usize];
        let mut tx = Transaction::write(0, &mut fill);
        assert_eq!(region.transact(&mut tx), Response::Ok);

        let mut spill = vec![0xFFu8; 8];
        let mut tx = Transaction::write(PAGE_SIZE - 4, &mut spill);
        assert_eq!(region.transact(&mut tx), Response::Failed);

        let mut readback = vec![0u8; PAGE_SIZE as usize];
        assert!(region.read_at(0, &mut readback));
        assert!(readback.iter().all(|byte| *byte == 0x5A));
    }

    #[test]
    fn overflowing_address_arithmetic_fails_cleanly() {
        let mut region = region(PAGE_SIZE);
        let mut buf = [0u8; 4];
        let mut tx = Transaction::read(u64::MAX - 1, &mut buf);
        assert_eq!(region.transact(&mut tx), Response::Failed);
    }

    #[test]
    fn protected_pages_reject_writes_but_not_reads() {
        let mut region = region(PAGE_SIZE * 2);
        region.protect_page(0);

        let mut byte = [1u8];
        let mut tx = Transaction::write(0x10, &mut byte);
        assert_eq!(region.transact(&mut tx), Response::Failed);

        let mut byte = [0u8];
        let mut tx = Transaction::read(0x10, &mut byte);
        assert_eq!(region.transact(&mut tx), Response::Ok);

        // The neighboring page stays writable.
        let mut byte = [1u8];
        let mut tx = Transaction::write(PAGE_SIZE + 0x10, &mut byte);
        assert_eq!(region.transact(&mut tx), Response::Ok);

        region.unprotect_page(0);
        let mut byte = [1u8];
        let mut tx = Transaction::write(0x10, &mut byte);
        assert_eq!(region.transact(&mut tx), Response::Ok);
    }

    #[test]
    fn debug_writes_bypass_protection() {
        let mut region = region(PAGE_SIZE);
        region.protect_page(0);

        let mut byte = [7u8];
        let mut tx = Transaction::write(0, &mut byte).debug();
        assert_eq!(region.transact(&mut tx), Response::Ok);
    }

    #[test]
    fn protected_overlap_spans_page_boundaries() {
        let mut region = region(PAGE_SIZE * 3);
        region.protect_page(PAGE_SIZE);

        assert!(region.protected_overlap(PAGE_SIZE - 2, 4));
        assert!(region.protected_overlap(PAGE_SIZE * 2 - 1, 1));
        assert!(!region.protected_overlap(0, PAGE_SIZE as u64));
        assert!(!region.protected_overlap(PAGE_SIZE * 2, 16));

        assert_eq!(
            region.protected_pages_in(PAGE_SIZE - 2, PAGE_SIZE + 4),
            vec![PAGE_SIZE]
        );
    }

    #[test]
    fn load_copies_images_and_rejects_oversized_ones() {
        use std::io::Write;

        let mut region = region(PAGE_SIZE);

        let mut image = tempfile::NamedTempFile::new().expect("temp image");
        image.write_all(b"boot code").expect("write image");
        let loaded = region.load(image.path()).expect("image fits");
        assert_eq!(loaded, 9);

        let mut readback = [0u8; 9];
        assert!(region.read_at(0, &mut readback));
        assert_eq!(&readback, b"boot code");

        let mut big = tempfile::NamedTempFile::new().expect("temp image");
        big.write_all(&vec![0u8; (PAGE_SIZE + 1) as usize])
            .expect("write image");
        assert!(matches!(
            region.load(big.path()),
            Err(MemoryError::ImageTooLarge { .. })
        ));

        assert!(matches!(
            region.load(std::path::Path::new("/nonexistent/image.bin")),
            Err(MemoryError::ImageUnreadable { .. })
        ));
    }
}
