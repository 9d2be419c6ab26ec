use std::collections::HashMap;

use thiserror::Error;

use crate::page::{Page, PageAttr, PAGE_SHIFT, PAGE_SIZE};

/// Maximum growth of the brk heap above its base. The anonymous mmap arena
/// begins directly above this bound.
pub const BRK_MAX: u64 = 0x100_0000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("read fault at {addr:#x}")]
    ReadFault { addr: u64 },
    #[error("write fault at {addr:#x}")]
    WriteFault { addr: u64 },
    #[error("execution fault at {addr:#x}")]
    ExecutionFault { addr: u64 },
    #[error("out of bounds at {addr:#x}: page limit {max_pages} reached")]
    OutOfBoundsFault { addr: u64, max_pages: usize },
    #[error("misaligned access at {addr:#x}")]
    MisalignedFault { addr: u64 },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Sparse mapping from page number to [`Page`].
///
/// Pages come into existence through [`Memory::set_page_attr`] (the loader
/// and mman-style host callbacks); plain loads and stores never invent
/// pages, so access to an address that was never granted faults instead of
/// silently reading zeros.
#[derive(Debug, Clone)]
pub struct Memory {
    pages: HashMap<u64, Page>,
    max_pages: usize,
    heap_base: u64,
    mmap_cursor: u64,
    exec_epoch: u64,
}

impl Memory {
    pub fn new(memory_max: u64) -> Self {
        Self {
            pages: HashMap::new(),
            max_pages: (memory_max / PAGE_SIZE as u64) as usize,
            heap_base: 0,
            mmap_cursor: BRK_MAX,
            exec_epoch: 0,
        }
    }

    #[inline]
    fn pageno(addr: u64) -> u64 {
        addr >> PAGE_SHIFT
    }

    #[inline]
    fn offset(addr: u64) -> usize {
        (addr & (PAGE_SIZE as u64 - 1)) as usize
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Attributes of the page containing `addr`, if materialized.
    pub fn attr(&self, addr: u64) -> Option<PageAttr> {
        self.pages.get(&Self::pageno(addr)).map(|p| p.attr)
    }

    /// Monotonic counter bumped whenever executable mappings may have
    /// changed; the CPU uses it to drop stale decoder caches.
    pub fn exec_epoch(&self) -> u64 {
        self.exec_epoch
    }

    fn materialize(&mut self, pageno: u64, attr: PageAttr) -> MemoryResult<&mut Page> {
        if !self.pages.contains_key(&pageno) {
            if self.pages.len() >= self.max_pages {
                return Err(MemoryError::OutOfBoundsFault {
                    addr: pageno << PAGE_SHIFT,
                    max_pages: self.max_pages,
                });
            }
            self.pages.insert(pageno, Page::zeroed(attr));
        }
        Ok(self.pages.get_mut(&pageno).expect("just inserted"))
    }

    fn readable_page(&self, addr: u64) -> MemoryResult<&Page> {
        match self.pages.get(&Self::pageno(addr)) {
            Some(page) if page.attr.contains(PageAttr::READ) => Ok(page),
            _ => Err(MemoryError::ReadFault { addr }),
        }
    }

    fn writable_page(&mut self, addr: u64) -> MemoryResult<&mut Page> {
        match self.pages.get_mut(&Self::pageno(addr)) {
            Some(page) if page.attr.contains(PageAttr::WRITE) => Ok(page),
            _ => Err(MemoryError::WriteFault { addr }),
        }
    }

    fn executable_page(&self, addr: u64) -> MemoryResult<&Page> {
        match self.pages.get(&Self::pageno(addr)) {
            Some(page) if page.attr.contains(PageAttr::EXEC) => Ok(page),
            _ => Err(MemoryError::ExecutionFault { addr }),
        }
    }

    /// Reads bytes into `dst`, splitting transparently across pages.
    /// Unaligned ranges are legal.
    pub fn read_bytes(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let mut cur = addr;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let page = self.readable_page(cur)?;
            let off = Self::offset(cur);
            let take = (PAGE_SIZE - off).min(remaining.len());
            remaining[..take].copy_from_slice(&page.data()[off..off + take]);
            cur = cur.wrapping_add(take as u64);
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    /// Writes bytes from `src`, performing copy-on-write per page.
    pub fn write_bytes(&mut self, addr: u64, src: &[u8]) -> MemoryResult<()> {
        let mut cur = addr;
        let mut remaining = src;
        while !remaining.is_empty() {
            let off = Self::offset(cur);
            let take = (PAGE_SIZE - off).min(remaining.len());
            let page = self.writable_page(cur)?;
            page.data_mut()[off..off + take].copy_from_slice(&remaining[..take]);
            cur = cur.wrapping_add(take as u64);
            remaining = &remaining[take..];
        }
        Ok(())
    }

    pub fn read_u8(&self, addr: u64) -> MemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    pub fn read_u16(&self, addr: u64) -> MemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_bytes(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    pub fn read_u32(&self, addr: u64) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_u64(&self, addr: u64) -> MemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> MemoryResult<()> {
        self.write_bytes(addr, &[value])
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) -> MemoryResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> MemoryResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> MemoryResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    /// Reads one instruction halfword. Checks the executable attribute, not
    /// the readable one: text may be execute-only.
    pub fn fetch_half(&self, addr: u64) -> MemoryResult<u16> {
        let page = self.executable_page(addr)?;
        let off = Self::offset(addr);
        // The PC is always 2-byte aligned, so a halfword never straddles.
        let data = page.data();
        Ok(u16::from_le_bytes([data[off], data[off + 1]]))
    }

    /// Attribute-blind byte read for the execution engine (decoder-cache
    /// construction and refresh). Faults only when a page in the range was
    /// never materialized.
    pub fn read_raw(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let mut cur = addr;
        let mut remaining = dst;
        while !remaining.is_empty() {
            let page = self
                .pages
                .get(&Self::pageno(cur))
                .ok_or(MemoryError::ReadFault { addr: cur })?;
            let off = Self::offset(cur);
            let take = (PAGE_SIZE - off).min(remaining.len());
            remaining[..take].copy_from_slice(&page.data()[off..off + take]);
            cur = cur.wrapping_add(take as u64);
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    /// The maximal contiguous run of executable pages containing `addr`,
    /// as `(start, len)` in bytes. `None` when `addr` is not executable.
    /// The run is capped so a pathological mapping cannot force an
    /// unboundedly large decoder cache.
    pub fn exec_region_around(&self, addr: u64) -> Option<(u64, u64)> {
        const MAX_PAGES: u64 = 4096;
        let pageno = Self::pageno(addr);
        let is_exec = |pn: u64| {
            self.pages
                .get(&pn)
                .is_some_and(|p| p.attr.contains(PageAttr::EXEC))
        };
        if !is_exec(pageno) {
            return None;
        }
        let mut first = pageno;
        while first > 0 && pageno - (first - 1) < MAX_PAGES && is_exec(first - 1) {
            first -= 1;
        }
        let mut last = pageno;
        while last - first + 1 < MAX_PAGES && is_exec(last + 1) {
            last += 1;
        }
        Some((first << PAGE_SHIFT, (last - first + 1) << PAGE_SHIFT))
    }

    /// Applies `attr` to every page intersecting `[addr, addr + len)`,
    /// materializing missing pages as zero pages. Existing page contents are
    /// retained; only the attributes change.
    pub fn set_page_attr(&mut self, addr: u64, len: u64, attr: PageAttr) -> MemoryResult<()> {
        let first = Self::pageno(addr);
        let last = Self::pageno(addr.wrapping_add(len).wrapping_sub(1));
        for pageno in first..=last {
            let page = self.materialize(pageno, attr)?;
            page.attr = attr;
        }
        self.exec_epoch += 1;
        Ok(())
    }

    /// Drops every page intersecting `[addr, addr + len)`. Shared pages give
    /// up one reference; exclusively owned pages are freed. Subsequent
    /// access faults unless the range is remapped.
    pub fn free_pages(&mut self, addr: u64, len: u64) {
        if len == 0 {
            return;
        }
        let first = Self::pageno(addr);
        let last = Self::pageno(addr.wrapping_add(len).wrapping_sub(1));
        for pageno in first..=last {
            self.pages.remove(&pageno);
        }
        self.exec_epoch += 1;
    }

    /// Bounded NUL-terminated string read.
    pub fn read_cstring(&self, addr: u64, max: usize) -> MemoryResult<String> {
        let mut out = Vec::new();
        let mut cur = addr;
        while out.len() < max {
            let byte = self.read_u8(cur)?;
            if byte == 0 {
                break;
            }
            out.push(byte);
            cur = cur.wrapping_add(1);
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Zero-copy enumeration of host-visible byte runs covering a readable
    /// guest range, for scatter/gather output. At most `max_buffers` runs
    /// are returned; a longer range is truncated to what fits.
    pub fn gather_buffers(
        &self,
        max_buffers: usize,
        addr: u64,
        len: u64,
    ) -> MemoryResult<Vec<&[u8]>> {
        let mut out = Vec::new();
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 && out.len() < max_buffers {
            let page = self.readable_page(cur)?;
            let off = Self::offset(cur);
            let take = ((PAGE_SIZE - off) as u64).min(remaining) as usize;
            out.push(&page.data()[off..off + take]);
            cur = cur.wrapping_add(take as u64);
            remaining -= take as u64;
        }
        Ok(out)
    }

    /// Mutable dual of [`Memory::gather_buffers`]: walks a writable guest
    /// range page by page (copy-on-write applied) and hands each host slice
    /// to `f`. Used by input-style host callbacks.
    pub fn update_buffers_mut(
        &mut self,
        addr: u64,
        len: u64,
        mut f: impl FnMut(&mut [u8]),
    ) -> MemoryResult<()> {
        let mut cur = addr;
        let mut remaining = len;
        while remaining > 0 {
            let off = Self::offset(cur);
            let take = ((PAGE_SIZE - off) as u64).min(remaining) as usize;
            let page = self.writable_page(cur)?;
            f(&mut page.data_mut()[off..off + take]);
            cur = cur.wrapping_add(take as u64);
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Copy-on-write fork. Every page in both the parent and the child
    /// becomes a shared reference to the same buffer; the first write on
    /// either side diverges transparently.
    pub fn fork(&mut self) -> Memory {
        let mut child_pages = HashMap::with_capacity(self.pages.len());
        for (&pageno, page) in self.pages.iter_mut() {
            child_pages.insert(pageno, page.share());
        }
        Memory {
            pages: child_pages,
            max_pages: self.max_pages,
            heap_base: self.heap_base,
            mmap_cursor: self.mmap_cursor,
            exec_epoch: self.exec_epoch,
        }
    }

    /// Sets the brk heap base and places the mmap arena above its growth
    /// bound.
    pub fn set_heap_base(&mut self, addr: u64) {
        self.heap_base = addr;
        self.mmap_cursor = addr + BRK_MAX;
    }

    pub fn heap_base(&self) -> u64 {
        self.heap_base
    }

    pub fn mmap_cursor(&self) -> u64 {
        self.mmap_cursor
    }

    pub fn set_mmap_cursor(&mut self, addr: u64) {
        self.mmap_cursor = addr;
    }
}
