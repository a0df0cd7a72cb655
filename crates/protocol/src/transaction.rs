//! Memory and port transaction data model.

/// Size in bytes of one directly mappable page.
pub const PAGE_SIZE: u64 = 4096;

/// Returns the page-aligned base address containing `addr`.
#[must_use]
pub const fn page_base(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// One memory or port access crossing the environment boundary.
///
/// The access size is `data.len()`. The caller owns the buffer; the
/// environment only reads or writes through it for the duration of the call
/// and retains no reference afterwards. For a read the environment fills
/// `data`; for a write it consumes `data`.
#[derive(Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct Transaction<'a> {
    /// Physical start address of the access.
    pub addr: u64,
    /// Caller-owned transfer buffer; its length is the access size.
    pub data: &'a mut [u8],
    /// `true` for a read (environment fills `data`), `false` for a write.
    pub is_read: bool,
    /// Access was made from an unprivileged execution mode.
    pub is_user: bool,
    /// Access was made from the secure world.
    pub is_secure: bool,
    /// Access is an instruction fetch.
    pub is_insn: bool,
    /// Access is half of an exclusive (load-link/store-conditional) pair.
    pub is_excl: bool,
    /// Access is a locked read-modify-write.
    pub is_lock: bool,
    /// Access targets port (I/O) space rather than memory space.
    pub is_port: bool,
    /// Debugger access: must be side-effect free on device state.
    pub is_debug: bool,
}

impl<'a> Transaction<'a> {
    /// Creates a read transaction filling `data` from `addr`.
    pub fn read(addr: u64, data: &'a mut [u8]) -> Self {
        Self::new(addr, data, true)
    }

    /// Creates a write transaction storing `data` at `addr`.
    pub fn write(addr: u64, data: &'a mut [u8]) -> Self {
        Self::new(addr, data, false)
    }

    fn new(addr: u64, data: &'a mut [u8], is_read: bool) -> Self {
        Self {
            addr,
            data,
            is_read,
            is_user: false,
            is_secure: false,
            is_insn: false,
            is_excl: false,
            is_lock: false,
            is_port: false,
            is_debug: false,
        }
    }

    /// Marks this transaction as an instruction fetch.
    #[must_use]
    pub const fn insn(mut self) -> Self {
        self.is_insn = true;
        self
    }

    /// Marks this transaction as a port-space access.
    #[must_use]
    pub const fn port(mut self) -> Self {
        self.is_port = true;
        self
    }

    /// Marks this transaction as a side-effect-free debugger access.
    #[must_use]
    pub const fn debug(mut self) -> Self {
        self.is_debug = true;
        self
    }

    /// Access size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Per-transaction completion status.
///
/// Always returned as a value the caller must inspect, never raised as an
/// error across the environment boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Response {
    /// The access completed.
    Ok,
    /// The access was rejected (out of range, protected, or refused).
    Failed,
    /// An exclusive store lost its reservation.
    NotExclusive,
    /// The address decoded to no target.
    AddressError,
    /// The target rejected the command itself.
    CommandError,
}

impl Response {
    /// Returns `true` when the transaction completed.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// Advisory execution hints a core may raise towards its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum HintKind {
    /// The core would yield its host thread if it could.
    Yield,
    /// The core entered a wait-for-interrupt state.
    Wfi,
    /// The core entered a wait-for-event state.
    Wfe,
    /// The core raised a send-event signal.
    Sev,
    /// The core raised a local send-event signal.
    Sevl,
}
