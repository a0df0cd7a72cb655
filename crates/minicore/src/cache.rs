//! Core-local fast-path caches: direct page handles and decoded pages.
//!
//! Both caches are populated lazily during stepping and dropped on the
//! invalidation calls the environment issues when backing state changes.
//! Direct page handles are the protocol's "cached page pointers"; decoded
//! pages are this core's translations.

use std::collections::HashMap;
use std::sync::Arc;

use cpulink_protocol::{DirectPage, PAGE_SIZE};

use crate::isa::MiniInsn;

/// Decoded instructions for one whole page.
pub type DecodedPage = Box<[MiniInsn]>;

/// Number of instruction slots in one decoded page.
pub const INSNS_PER_PAGE: usize = (PAGE_SIZE / crate::isa::INSN_BYTES) as usize;

#[derive(Default)]
pub struct PageCache {
    exec: HashMap<u64, DecodedPage>,
    data: HashMap<u64, Arc<dyn DirectPage>>,
}

impl PageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decoded(&self, page_addr: u64) -> Option<&[MiniInsn]> {
        self.exec.get(&page_addr).map(AsRef::as_ref)
    }

    pub fn insert_decoded(&mut self, page_addr: u64, decoded: DecodedPage) {
        self.exec.insert(page_addr, decoded);
    }

    pub fn data_page(&self, page_addr: u64) -> Option<&Arc<dyn DirectPage>> {
        self.data.get(&page_addr)
    }

    pub fn insert_data_page(&mut self, page_addr: u64, page: Arc<dyn DirectPage>) {
        self.data.insert(page_addr, page);
    }

    /// Drops the cached direct handle for one page.
    pub fn invalidate_page_ptr(&mut self, page_addr: u64) {
        self.data.remove(&page_addr);
    }

    /// Drops every cached direct handle.
    pub fn invalidate_page_ptrs(&mut self) {
        self.data.clear();
    }

    /// Drops every decoded page.
    pub fn tb_flush(&mut self) {
        self.exec.clear();
    }

    /// Drops decoded pages overlapping the inclusive range `[start, end]`.
    pub fn tb_flush_range(&mut self, start: u64, end: u64) {
        self.exec
            .retain(|&page, _| page.saturating_add(PAGE_SIZE - 1) < start || page > end);
    }

    /// Drops everything; used by core reset.
    pub fn clear(&mut self) {
        self.exec.clear();
        self.data.clear();
    }

    pub fn has_decoded(&self, page_addr: u64) -> bool {
        self.exec.contains_key(&page_addr)
    }
}

/// Decodes a full page of little-endian instruction words.
#[must_use]
pub fn decode_page(bytes: &[u8]) -> DecodedPage {
    bytes
        .chunks_exact(crate::isa::INSN_BYTES as usize)
        .map(|chunk| crate::isa::decode(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])))
        .collect()
}
