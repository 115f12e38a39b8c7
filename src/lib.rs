// RustyFTL - Crash-consistent flash translation layer
// Core library module

pub mod blkmgr;
pub mod cache;
pub mod chlog;
pub mod error;
pub mod flash;
pub mod ftl;
pub mod gc;
pub mod geometry;
pub mod layout;
pub mod pgmap;
pub mod recovery;
pub mod stats;

pub use error::{FtlError, Result};
pub use flash::{FlashDevice, SimFlash};
pub use ftl::{Ftl, TrimRange};
pub use geometry::{Epoch, Geometry, Lpn, Ppn};
pub use stats::FtlStats;

use serde::{Deserialize, Serialize};

/// FTL configuration: device geometry plus the sizing knobs the engine
/// surfaces. Geometry is fixed for the life of the device; the knobs tune
/// GC pressure, log batching, and cache size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FtlConfig {
    pub banks: u32,
    pub blocks_per_bank: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub bytes_per_sector: u32,
    /// Host-visible capacity in logical pages.
    pub logical_pages: u32,
    /// Full-page write buffers per bank.
    pub cache_bufs_per_bank: u32,
    /// Data blocks per bank reserved for the hot placement region.
    pub hot_region_blocks: u32,
    /// Per-region free-block floor below which GC is needed.
    pub gc_threshold: u32,
    /// Aggregate free-block deficit that triggers a batch GC pass.
    pub batch_gc_threshold: u32,
    pub num_log_blks_per_bank: u32,
    /// Map-delta pairs per MAPENT log page.
    pub num_mapents_per_page: u32,
    /// Dependency records per DEPENT log page.
    pub num_depents_per_page: u32,
    /// Headroom subtracted from the per-barrier mapent budget so the last
    /// page is well utilized before a checkpoint triggers.
    pub chkpt_mapent_slack: u32,
    /// Fold a flush into the write path after this many seconds without a
    /// barrier. 0 disables.
    pub auto_flush_secs: u32,
    /// Known-bad blocks from the manufacturing scan, as (bank, block).
    pub bad_blocks: Vec<(u32, u32)>,
}

impl Default for FtlConfig {
    fn default() -> Self {
        Self {
            banks: 8,
            blocks_per_bank: 2048,
            pages_per_block: 128,
            sectors_per_page: 32,
            bytes_per_sector: 512,
            logical_pages: 1_871_472,
            cache_bufs_per_bank: 64,
            hot_region_blocks: 60,
            gc_threshold: 120,
            batch_gc_threshold: 16,
            num_log_blks_per_bank: 2,
            num_mapents_per_page: 1800,
            num_depents_per_page: 750,
            chkpt_mapent_slack: 512,
            auto_flush_secs: 5,
            bad_blocks: Vec::new(),
        }
    }
}

impl FtlConfig {
    pub fn geometry(&self) -> Geometry {
        Geometry {
            banks: self.banks,
            blocks_per_bank: self.blocks_per_bank,
            pages_per_block: self.pages_per_block,
            sectors_per_page: self.sectors_per_page,
            bytes_per_sector: self.bytes_per_sector,
            logical_pages: self.logical_pages,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let geo = self.geometry();
        let page_bytes = geo.bytes_per_page();

        if self.banks == 0 || self.blocks_per_bank == 0 || self.logical_pages == 0 {
            return Err(FtlError::Config("geometry dimensions must be nonzero".into()));
        }
        if self.pages_per_block < 3 {
            return Err(FtlError::Config(
                "a block needs at least two data pages plus the summary page".into(),
            ));
        }
        if self.sectors_per_page == 0 || self.bytes_per_sector == 0 {
            return Err(FtlError::Config("page shape must be nonzero".into()));
        }
        if self.cache_bufs_per_bank < 2 {
            return Err(FtlError::Config(
                "need at least two cache buffers per bank".into(),
            ));
        }
        if self.hot_region_blocks == 0 {
            return Err(FtlError::Config("hot region must hold at least one block".into()));
        }
        if self.num_log_blks_per_bank == 0 {
            return Err(FtlError::Config("log area must hold at least one block".into()));
        }
        if self.gc_threshold == 0 || self.batch_gc_threshold == 0 {
            return Err(FtlError::Config("GC thresholds must be nonzero".into()));
        }

        // Every persistent structure must fit its page.
        let summary_bytes = self.pages_per_block as usize * 4 + 4;
        if summary_bytes > page_bytes {
            return Err(FtlError::Config(format!(
                "summary page needs {summary_bytes} bytes, page is {page_bytes}"
            )));
        }
        let commit_bytes = 8 + self.banks as usize * geometry::NUM_REGIONS * 4;
        if commit_bytes > page_bytes {
            return Err(FtlError::Config(format!(
                "commit record needs {commit_bytes} bytes, page is {page_bytes}"
            )));
        }
        let mapent_bytes = layout::LOG_PAGE_HEADER_BYTES
            + self.num_mapents_per_page as usize * layout::MAPENT_BYTES;
        if mapent_bytes > page_bytes {
            return Err(FtlError::Config(format!(
                "{} mapents need {mapent_bytes} bytes, page is {page_bytes}",
                self.num_mapents_per_page
            )));
        }
        let depent_bytes = layout::LOG_PAGE_HEADER_BYTES
            + self.num_depents_per_page as usize * layout::DEPENT_BYTES;
        if depent_bytes > page_bytes {
            return Err(FtlError::Config(format!(
                "{} depents need {depent_bytes} bytes, page is {page_bytes}",
                self.num_depents_per_page
            )));
        }

        // The striped map snapshot plus its commit page must fit one
        // shadow block per bank.
        if geo.map_commit_page() >= self.pages_per_block {
            return Err(FtlError::Config(format!(
                "map snapshot needs {} pages per bank, block holds {}",
                geo.map_commit_page() + 1,
                self.pages_per_block
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        FtlConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_oversized_mapent_page() {
        let cfg = FtlConfig {
            num_mapents_per_page: 1_000_000,
            ..FtlConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FtlError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_snapshot_overflow() {
        let cfg = FtlConfig {
            logical_pages: u32::MAX / 8,
            ..FtlConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(FtlError::Config(_))));
    }
}
