//! What the analysis needs from the binary loader.

use rustc_hash::FxHashMap;

/// Services the surrounding loader provides to the analysis.
pub trait Loader {
    /// Whether the main binary object maps `addr`.
    fn contains_addr(&self, addr: u64) -> bool;

    /// Name of the PLT stub at `addr`, if there is one.
    fn find_plt_stub_name(&self, addr: u64) -> Option<String>;

    /// Name of the symbol covering `addr`, if any.
    fn find_symbol(&self, addr: u64) -> Option<String>;

    /// Reads `size` bytes of read-only backing memory at `addr`.
    fn read_bytes(&self, addr: u64, size: u64) -> Option<Vec<u8>>;

    /// The initial `rtoc` value of a PPC64 binary.
    fn ppc64_initial_rtoc(&self) -> Option<u64> {
        None
    }
}

/// A loader over in-memory data: byte segments, a main-object range, and
/// symbol tables. Enough for tests and for embedders without a real binary
/// behind them.
#[derive(Debug, Default)]
pub struct StaticImage {
    segments: Vec<(u64, Vec<u8>)>,
    main_range: Option<(u64, u64)>,
    symbols: FxHashMap<u64, String>,
    plt_stubs: FxHashMap<u64, String>,
    rtoc: Option<u64>,
}

impl StaticImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `addr`.
    pub fn add_segment(&mut self, addr: u64, bytes: Vec<u8>) {
        self.segments.push((addr, bytes));
    }

    /// Declares `[start, end)` as the extent of the main object.
    pub fn set_main_range(&mut self, start: u64, end: u64) {
        self.main_range = Some((start, end));
    }

    pub fn add_symbol(&mut self, addr: u64, name: impl Into<String>) {
        self.symbols.insert(addr, name.into());
    }

    pub fn add_plt_stub(&mut self, addr: u64, name: impl Into<String>) {
        self.plt_stubs.insert(addr, name.into());
    }

    pub fn set_rtoc(&mut self, rtoc: u64) {
        self.rtoc = Some(rtoc);
    }
}

impl Loader for StaticImage {
    fn contains_addr(&self, addr: u64) -> bool {
        self.main_range
            .is_some_and(|(start, end)| (start..end).contains(&addr))
    }

    fn find_plt_stub_name(&self, addr: u64) -> Option<String> {
        self.plt_stubs.get(&addr).cloned()
    }

    fn find_symbol(&self, addr: u64) -> Option<String> {
        self.symbols.get(&addr).cloned()
    }

    fn read_bytes(&self, addr: u64, size: u64) -> Option<Vec<u8>> {
        for (base, bytes) in &self.segments {
            let end = base + bytes.len() as u64;
            if addr >= *base && addr.saturating_add(size) <= end {
                let lo = (addr - base) as usize;
                return Some(bytes[lo..lo + size as usize].to_vec());
            }
        }
        None
    }

    fn ppc64_initial_rtoc(&self) -> Option<u64> {
        self.rtoc
    }
}
