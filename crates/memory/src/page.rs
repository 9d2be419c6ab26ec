use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

/// Guest page size in bytes. Address bits below [`PAGE_SHIFT`] index within a
/// page; the bits above index the page table.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

type PageBuf = [u8; PAGE_SIZE];

bitflags! {
    /// Per-page access attributes.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageAttr: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl PageAttr {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXEC);
    pub const RWX: Self = Self::RW.union(Self::EXEC);
}

/// Backing storage of a page.
///
/// `Shared` buffers are immutable; the first write converts the page to an
/// `Owned` buffer (copy-on-write) and drops one reference. Refcounts are
/// `Arc` so forked machines may run on separate host threads.
#[derive(Clone, Debug)]
pub enum PageData {
    Owned(Box<PageBuf>),
    Shared(Arc<PageBuf>),
}

/// The all-zero buffer backing freshly materialized pages. Allocation is
/// lazy in the buffer sense: a new page costs one refcount until written.
fn zero_buf() -> &'static Arc<PageBuf> {
    static ZERO: OnceLock<Arc<PageBuf>> = OnceLock::new();
    ZERO.get_or_init(|| Arc::new([0u8; PAGE_SIZE]))
}

#[derive(Clone, Debug)]
pub struct Page {
    pub attr: PageAttr,
    data: PageData,
}

impl Page {
    /// A new zero page sharing the global zero buffer.
    pub fn zeroed(attr: PageAttr) -> Self {
        Self {
            attr,
            data: PageData::Shared(Arc::clone(zero_buf())),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.data, PageData::Shared(_))
    }

    pub fn data(&self) -> &[u8] {
        match &self.data {
            PageData::Owned(buf) => &buf[..],
            PageData::Shared(buf) => &buf[..],
        }
    }

    /// Mutable view of the page contents, performing copy-on-write when the
    /// buffer is shared. After this call the page is exclusively owned.
    pub fn data_mut(&mut self) -> &mut [u8] {
        if let PageData::Shared(buf) = &self.data {
            let copy = Box::new(**buf);
            self.data = PageData::Owned(copy);
        }
        match &mut self.data {
            PageData::Owned(buf) => &mut buf[..],
            PageData::Shared(_) => unreachable!("just converted to owned"),
        }
    }

    /// Converts an owned buffer into a shared one (used by fork) and returns
    /// a page referencing the same buffer.
    pub fn share(&mut self) -> Page {
        if let PageData::Owned(_) = self.data {
            let owned = std::mem::replace(
                &mut self.data,
                PageData::Shared(Arc::clone(zero_buf())),
            );
            let PageData::Owned(buf) = owned else {
                unreachable!()
            };
            self.data = PageData::Shared(Arc::from(buf));
        }
        self.clone()
    }
}
