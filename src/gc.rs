// Garbage collection.
//
// Runs inside the host-write path once the batch condition holds: the cache
// has been drained first, so every live page is on flash and the summary
// page of any victim reflects reality. Live pages move to the cold region
// with a GC tag in their spare bytes; the emptied victim is parked and its
// erase deferred until the bank is next idle (or the next GC on the bank
// needs it synchronously).

use tracing::{debug, info, warn};

use crate::blkmgr::BlockManager;
use crate::chlog::ChangeLog;
use crate::error::{FtlError, Result};
use crate::flash::FlashDevice;
use crate::geometry::{Epoch, Geometry, REGION_COLD};
use crate::layout::{PageTag, SummaryPage};
use crate::pgmap::PageMap;
use crate::stats::FtlStats;

pub struct GcCtx<'a, D: FlashDevice> {
    pub dev: &'a mut D,
    pub blkmgr: &'a mut BlockManager,
    pub pgmap: &'a mut PageMap,
    pub chlog: &'a mut ChangeLog,
    pub stats: &'a mut FtlStats,
    pub epoch: Epoch,
}

pub struct GcEngine {
    geo: Geometry,
    first_gc: bool,
}

impl GcEngine {
    pub fn new(geo: Geometry) -> GcEngine {
        GcEngine {
            geo,
            first_gc: true,
        }
    }

    /// Batch loop: collect every (bank, region) below threshold and repeat
    /// until a full sweep finds none. Only the GC-managed (cold) regions
    /// participate; the hot pool is small by construction and never sinks
    /// below threshold through placement.
    pub fn run_batch<D: FlashDevice>(&mut self, ctx: &mut GcCtx<'_, D>) -> Result<()> {
        loop {
            let mut done = true;
            for region in REGION_COLD..crate::geometry::NUM_REGIONS {
                for bank in 0..self.geo.banks {
                    if ctx.blkmgr.region_gc_needed(bank, region) {
                        self.collect(bank, region, ctx)?;
                    }
                }
            }
            for region in REGION_COLD..crate::geometry::NUM_REGIONS {
                for bank in 0..self.geo.banks {
                    if ctx.blkmgr.region_gc_needed(bank, region) {
                        done = false;
                    }
                }
            }
            if done {
                return Ok(());
            }
        }
    }

    /// Reclaim one victim block.
    pub fn collect<D: FlashDevice>(
        &mut self,
        bank: u32,
        region: usize,
        ctx: &mut GcCtx<'_, D>,
    ) -> Result<()> {
        if self.first_gc {
            info!("first garbage collection triggered");
            self.first_gc = false;
        }
        ctx.stats.gc_runs += 1;

        // A victim from the previous cycle may still be awaiting its
        // deferred erase; it has to go now so the ring stays consistent.
        if let Some(prev) = ctx.blkmgr.take_pending_victim(bank) {
            ctx.stats.gc_erase_sync += 1;
            ctx.dev.block_erase(bank, prev)?;
        }

        let victim = ctx.blkmgr.select_victim(bank, region)?;
        let vcount = ctx.blkmgr.vcount(bank, victim);

        // The summary page holds the per-page lpn array of the victim.
        let ppb = self.geo.pages_per_block;
        let bps = self.geo.bytes_per_sector as usize;
        let len = SummaryPage::byte_len(ppb).div_ceil(bps) * bps;
        let mut buf = vec![0u8; len];
        ctx.dev.page_read(
            bank,
            victim,
            self.geo.summary_page(),
            0,
            (len / bps) as u32,
            &mut buf,
        )?;
        let summary = SummaryPage::decode(&buf, ppb);

        let mut n_live = 0u32;
        for page in 0..ppb - 1 {
            let ppn = self.geo.ppn(victim, page);
            let lpn = summary.lpns[page as usize];
            if ctx.pgmap.ppn(lpn) != ppn {
                continue;
            }
            let dst_ppn =
                ctx.pgmap
                    .alloc_active_ppn(bank, REGION_COLD, ctx.epoch, ctx.blkmgr, ctx.dev)?;
            let dst_blk = self.geo.blk_of(dst_ppn);
            let dst_page = self.geo.page_of(dst_ppn);
            ctx.pgmap.set_ppn(lpn, dst_ppn);
            ctx.pgmap.set_lpn_slot(bank, REGION_COLD, dst_page, lpn);
            ctx.blkmgr.inc_vcount(bank, dst_blk)?;
            ctx.chlog.push_mapent(lpn, dst_ppn);
            n_live += 1;
            ctx.dev.page_copyback(
                bank,
                victim,
                page,
                dst_blk,
                dst_page,
                &PageTag::GcSurvivor { lpn },
            )?;
        }
        ctx.stats.gc_pages_copied += u64::from(n_live);
        ctx.stats.gc_victim_vcounts += u64::from(vcount);

        if n_live != u32::from(vcount) {
            warn!(bank, victim, n_live, vcount, "reverse map out of sync");
            return Err(FtlError::invariant(format!(
                "bank {bank} block {victim}: {n_live} live pages but vcount {vcount}"
            )));
        }
        if n_live >= ppb - 1 {
            // A full victim means the threshold left GC no room to help.
            return Err(FtlError::invariant(format!(
                "bank {bank} block {victim}: victim entirely live, GC cannot proceed"
            )));
        }

        ctx.blkmgr.retire_victim(bank, region, victim);
        debug!(bank, region, victim, n_live, "victim collected");
        Ok(())
    }
}
