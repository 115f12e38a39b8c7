// Geometry and addressing units shared by every FTL component.
//
// A physical page number (ppn) is flat within its bank: the owning block is
// `ppn / pages_per_block` and the in-block page index is the remainder. The
// last page of every data block is reserved for the block summary.

use serde::{Deserialize, Serialize};

/// Logical page number (host address space, `lba / sectors_per_page`).
pub type Lpn = u32;
/// Physical page number, flat within one bank. `0` means "never written".
pub type Ppn = u32;
/// Write epoch. Incremented once per host write request.
pub type Epoch = u32;

/// Number of placement regions per bank: 0 = hot, 1 = cold.
pub const NUM_REGIONS: usize = 2;
pub const REGION_HOT: usize = 0;
pub const REGION_COLD: usize = NUM_REGIONS - 1;

/// Fixed device shape. Built once from [`crate::FtlConfig`] and copied into
/// every component that needs address arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub banks: u32,
    pub blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub bytes_per_sector: u32,
    /// Size of the host-visible logical address space, in pages.
    pub logical_pages: u32,
}

impl Geometry {
    #[inline]
    pub fn bytes_per_page(&self) -> usize {
        (self.sectors_per_page * self.bytes_per_sector) as usize
    }

    #[inline]
    pub fn logical_sectors(&self) -> u64 {
        self.logical_pages as u64 * self.sectors_per_page as u64
    }

    #[inline]
    pub fn blk_of(&self, ppn: Ppn) -> u32 {
        ppn / self.pages_per_block
    }

    #[inline]
    pub fn page_of(&self, ppn: Ppn) -> u32 {
        ppn % self.pages_per_block
    }

    #[inline]
    pub fn ppn(&self, blk: u32, page: u32) -> Ppn {
        blk * self.pages_per_block + page
    }

    /// Bank that owns a logical page.
    #[inline]
    pub fn bank_of(&self, lpn: Lpn) -> u32 {
        lpn % self.banks
    }

    #[inline]
    pub fn lpn_of(&self, lba: u32) -> Lpn {
        lba / self.sectors_per_page
    }

    /// In-block index of the summary page.
    #[inline]
    pub fn summary_page(&self) -> u32 {
        self.pages_per_block - 1
    }

    /// Bytes occupied by the serialized L2P table, rounded up to a whole
    /// number of sectors.
    pub fn map_table_bytes(&self) -> usize {
        let raw = self.logical_pages as usize * 4;
        let sector = self.bytes_per_sector as usize;
        raw.div_ceil(sector) * sector
    }

    /// Page index of the map-snapshot commit record inside a shadow map
    /// block: the first page past the striped table content.
    pub fn map_commit_page(&self) -> u32 {
        let map_pages = self.map_table_bytes().div_ceil(self.bytes_per_page()) as u32;
        map_pages.div_ceil(self.banks)
    }
}
