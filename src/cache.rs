// # Write Cache - Per-Bank Page Buffers with LRU Eviction
//
// Absorbs small and repeated writes before they reach flash. Every entry is
// a full page; partial host writes are merged into the buffer (after a
// preread fills the holes) and coalesce with later writes to the same lpn.
// Eviction picks the least-recently-used dirty entry and issues an
// asynchronous full-page program; reads of cached lpns are served straight
// from the buffer.
//
// One entry per bank may have a device operation still in flight (either a
// preread filling its holes or its eviction program). That entry must not
// be reused or overwritten until the operation settles.

use tracing::trace;

use crate::blkmgr::BlockManager;
use crate::chlog::ChangeLog;
use crate::error::{FtlError, Result};
use crate::flash::{wait_bank_idle, FlashDevice};
use crate::geometry::{Epoch, Geometry, Lpn, REGION_COLD};
use crate::layout::PageTag;
use crate::pgmap::PageMap;
use crate::stats::FtlStats;

/// Everything an eviction touches outside the cache itself.
pub struct EvictionCtx<'a, D: FlashDevice> {
    pub dev: &'a mut D,
    pub blkmgr: &'a mut BlockManager,
    pub pgmap: &'a mut PageMap,
    pub chlog: &'a mut ChangeLog,
    pub stats: &'a mut FtlStats,
    pub epoch: Epoch,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    lpn: Option<Lpn>,
    dirty: bool,
    pg_span: u16,
    epoch: Epoch,
}

struct BankCache {
    ents: Vec<CacheEntry>,
    /// Buffer ids ordered by recency; position 0 is the most recent.
    lru: Vec<usize>,
    bufs: Vec<Vec<u8>>,
    stall: bool,
    n_dirty: u16,
    /// Entry whose device operation has not settled yet.
    incomplete: Option<usize>,
}

pub struct WriteCache {
    geo: Geometry,
    banks: Vec<BankCache>,
    bufs_per_bank: usize,
    pool_bank: u32,
}

impl WriteCache {
    pub fn new(geo: Geometry, bufs_per_bank: usize) -> WriteCache {
        let banks = (0..geo.banks)
            .map(|_| BankCache {
                ents: vec![
                    CacheEntry {
                        lpn: None,
                        dirty: false,
                        pg_span: 0,
                        epoch: 0,
                    };
                    bufs_per_bank
                ],
                lru: (0..bufs_per_bank).collect(),
                bufs: vec![vec![0u8; geo.bytes_per_page()]; bufs_per_bank],
                stall: false,
                n_dirty: 0,
                incomplete: None,
            })
            .collect();
        WriteCache {
            geo,
            banks,
            bufs_per_bank,
            pool_bank: 0,
        }
    }

    // ------------------------------------------------------------------
    // Lookup and entry state
    // ------------------------------------------------------------------

    pub fn lookup(&self, bank: u32, lpn: Lpn) -> Option<usize> {
        self.banks[bank as usize]
            .ents
            .iter()
            .position(|e| e.lpn == Some(lpn))
    }

    pub fn is_dirty(&self, bank: u32, buf_id: usize) -> bool {
        self.banks[bank as usize].ents[buf_id].dirty
    }

    pub fn entry_epoch(&self, bank: u32, buf_id: usize) -> Epoch {
        self.banks[bank as usize].ents[buf_id].epoch
    }

    pub fn entry_pg_span(&self, bank: u32, buf_id: usize) -> u16 {
        self.banks[bank as usize].ents[buf_id].pg_span
    }

    pub fn buf(&self, bank: u32, buf_id: usize) -> &[u8] {
        &self.banks[bank as usize].bufs[buf_id]
    }

    pub fn buf_mut(&mut self, bank: u32, buf_id: usize) -> &mut [u8] {
        &mut self.banks[bank as usize].bufs[buf_id]
    }

    pub fn total_dirty(&self) -> u32 {
        self.banks.iter().map(|b| u32::from(b.n_dirty)).sum()
    }

    pub fn stall(&mut self, bank: u32) {
        self.banks[bank as usize].stall = true;
    }

    pub fn release(&mut self, bank: u32) {
        self.banks[bank as usize].stall = false;
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Merge host sectors into a buffer and mark it dirty in the current
    /// epoch. `src` holds the covered sectors, i.e. the page minus
    /// `hole_left` leading and `hole_right` trailing sectors. A slot with a
    /// device operation in flight is waited on before being overwritten.
    /// `complete = false` records that a preread into this buffer is still
    /// settling.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue<D: FlashDevice>(
        &mut self,
        dev: &mut D,
        bank: u32,
        lpn: Lpn,
        buf_id: usize,
        hole_left: u32,
        hole_right: u32,
        complete: bool,
        src: &[u8],
        epoch: Epoch,
        pg_span: u16,
    ) -> Result<()> {
        self.wait_buf_complete(dev, bank, buf_id)?;

        let bps = self.geo.bytes_per_sector as usize;
        let start = hole_left as usize * bps;
        let end = (self.geo.sectors_per_page - hole_right) as usize * bps;
        if src.len() != end - start {
            return Err(FtlError::HostMisuse(format!(
                "write span is {} bytes, sector holes leave {}",
                src.len(),
                end - start
            )));
        }

        let bc = &mut self.banks[bank as usize];
        bc.bufs[buf_id][start..end].copy_from_slice(src);

        let ent = &mut bc.ents[buf_id];
        ent.lpn = Some(lpn);
        ent.pg_span = pg_span;
        ent.epoch = epoch;
        if !ent.dirty {
            bc.n_dirty += 1;
        }
        ent.dirty = true;
        if !complete {
            bc.incomplete = Some(buf_id);
        }

        // Move to the LRU head.
        let pos = bc
            .lru
            .iter()
            .position(|&id| id == buf_id)
            .ok_or_else(|| FtlError::invariant("buffer missing from LRU list"))?;
        bc.lru[..=pos].rotate_right(1);

        trace!(bank, lpn, buf_id, epoch, "cache enqueue");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Evict the least-recently-used dirty entry of one bank.
    ///
    /// Returns `Ok(true)` when the bank holds no dirty entry (quiescent)
    /// and `Ok(false)` when it either issued a program or could not make
    /// progress (bank busy or stalled); the caller polls again.
    pub fn dequeue<D: FlashDevice>(
        &mut self,
        bank: u32,
        ctx: &mut EvictionCtx<'_, D>,
    ) -> Result<bool> {
        if self.banks[bank as usize].stall || !ctx.dev.bank_idle(bank) {
            return Ok(false);
        }
        self.banks[bank as usize].incomplete = None;

        let bc = &self.banks[bank as usize];
        // Last dirty id in recency order = least recently used dirty.
        let mut victim = None;
        for &id in &bc.lru {
            if bc.ents[id].dirty {
                victim = Some(id);
            }
        }
        let buf_id = match victim {
            Some(id) => id,
            None => return Ok(true),
        };
        let lpn = self.banks[bank as usize].ents[buf_id]
            .lpn
            .ok_or_else(|| FtlError::invariant("dirty cache entry without an lpn"))?;

        // Resolve placement. Overwrites release the old physical page and
        // feed the update-distance tracker that informs hot/cold placement;
        // placement itself goes to the cold region.
        let region = REGION_COLD;
        let old_ppn = ctx.pgmap.ppn(lpn);
        if old_ppn != 0 {
            let old_blk = self.geo.blk_of(old_ppn);
            ctx.blkmgr.dec_vcount(bank, old_blk)?;
            let dist = ctx.epoch.wrapping_sub(ctx.pgmap.blk_birth_epoch(bank, old_blk));
            ctx.stats.update_distance.record(dist);
        }

        let new_ppn = ctx
            .pgmap
            .alloc_active_ppn(bank, region, ctx.epoch, ctx.blkmgr, ctx.dev)?;
        let new_blk = self.geo.blk_of(new_ppn);
        let new_page = self.geo.page_of(new_ppn);

        ctx.pgmap.set_lpn_slot(bank, region, new_page, lpn);
        ctx.pgmap.set_ppn(lpn, new_ppn);
        ctx.blkmgr.inc_vcount(bank, new_blk)?;
        ctx.chlog.push_mapent(lpn, new_ppn);

        let bc = &mut self.banks[bank as usize];
        bc.incomplete = Some(buf_id);
        bc.ents[buf_id].dirty = false;
        bc.n_dirty -= 1;

        let tag = PageTag::HostWrite {
            lpn,
            pg_span: bc.ents[buf_id].pg_span,
            epoch: bc.ents[buf_id].epoch,
        };
        ctx.stats.data_pages_programmed += 1;
        ctx.dev
            .page_program(bank, new_blk, new_page, &bc.bufs[buf_id], &tag)?;

        trace!(bank, lpn, new_ppn, "cache evict");
        Ok(false)
    }

    /// Targeted wait for one buffer whose device operation is in flight.
    pub fn wait_buf_complete<D: FlashDevice>(
        &mut self,
        dev: &mut D,
        bank: u32,
        buf_id: usize,
    ) -> Result<()> {
        if self.banks[bank as usize].incomplete == Some(buf_id) {
            wait_bank_idle(dev, bank)?;
            self.banks[bank as usize].incomplete = None;
        }
        Ok(())
    }

    /// Background poll: either push one eviction on the round-robin bank or
    /// use the idle time to erase its parked GC victim.
    pub fn pool<D: FlashDevice>(&mut self, ctx: &mut EvictionCtx<'_, D>) -> Result<()> {
        let bank = self.pool_bank;
        if u32::from(self.banks[bank as usize].n_dirty) > self.bufs_per_bank as u32 / 2 {
            self.dequeue(bank, ctx)?;
        } else {
            ctx.blkmgr.erase_victim_if_idle(ctx.dev, bank, ctx.stats)?;
        }
        self.pool_bank = (self.pool_bank + 1) % self.geo.banks;
        Ok(())
    }

    /// Drain every bank: repeated eviction sweeps until a full pass finds
    /// no dirty entry anywhere, then quiesce the device.
    pub fn flush_all<D: FlashDevice>(&mut self, ctx: &mut EvictionCtx<'_, D>) -> Result<()> {
        loop {
            let mut done = true;
            for bank in 0..self.geo.banks {
                done &= self.dequeue(bank, ctx)?;
            }
            if done {
                break;
            }
        }
        ctx.dev.flash_finish()?;
        Ok(())
    }

    /// Find a clean buffer for a new lpn, evicting if every buffer is
    /// dirty. Returns the least-recently-used clean buffer.
    pub fn clean_buf<D: FlashDevice>(
        &mut self,
        bank: u32,
        ctx: &mut EvictionCtx<'_, D>,
    ) -> Result<usize> {
        const MAX_SPINS: u32 = 1 << 22;
        let mut spins = 0;
        while self.banks[bank as usize].ents.iter().all(|e| e.dirty) {
            self.pool(ctx)?;
            spins += 1;
            if spins > MAX_SPINS {
                return Err(FtlError::invariant(format!(
                    "bank {bank}: cache never drained a clean buffer"
                )));
            }
        }
        let bc = &self.banks[bank as usize];
        let mut choice = None;
        for &id in &bc.lru {
            if !bc.ents[id].dirty {
                choice = Some(id);
            }
        }
        choice.ok_or_else(|| FtlError::invariant("no clean cache buffer after drain"))
    }

    /// Drop any cached entries covering `[lpn, lpn + n_pages)`. Used by
    /// trim so stale buffers cannot shadow the cleared mappings.
    pub fn invalidate_range(&mut self, lpn: Lpn, n_pages: u32) {
        let end = lpn.saturating_add(n_pages);
        for bc in self.banks.iter_mut() {
            for ent in bc.ents.iter_mut() {
                if let Some(l) = ent.lpn {
                    if l >= lpn && l < end {
                        ent.lpn = None;
                        if ent.dirty {
                            bc.n_dirty -= 1;
                        }
                        ent.dirty = false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;
    use crate::FtlConfig;

    fn cfg() -> FtlConfig {
        FtlConfig {
            banks: 2,
            blocks_per_bank: 32,
            pages_per_block: 8,
            sectors_per_page: 4,
            bytes_per_sector: 64,
            logical_pages: 128,
            cache_bufs_per_bank: 4,
            hot_region_blocks: 2,
            gc_threshold: 4,
            batch_gc_threshold: 2,
            num_log_blks_per_bank: 4,
            num_mapents_per_page: 16,
            num_depents_per_page: 8,
            chkpt_mapent_slack: 0,
            auto_flush_secs: 3600,
            bad_blocks: vec![],
        }
    }

    struct Rig {
        cache: WriteCache,
        dev: SimFlash,
        blkmgr: BlockManager,
        pgmap: PageMap,
        chlog: ChangeLog,
        stats: FtlStats,
    }

    fn rig() -> Rig {
        let c = cfg();
        let geo = c.geometry();
        let mut blkmgr = BlockManager::new(&c).unwrap();
        let mut pgmap = PageMap::new(geo);
        pgmap.init_cursors(&mut blkmgr).unwrap();
        Rig {
            cache: WriteCache::new(geo, c.cache_bufs_per_bank as usize),
            dev: SimFlash::new(geo),
            blkmgr,
            pgmap,
            chlog: ChangeLog::new(&c),
            stats: FtlStats::default(),
        }
    }

    fn full_page(byte: u8) -> Vec<u8> {
        vec![byte; 256]
    }

    #[test]
    fn test_enqueue_moves_to_lru_head_and_coalesces() {
        let mut r = rig();
        let page = full_page(0xAA);
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 0, 0, true, &page, 1, 1)
            .unwrap();
        r.cache
            .enqueue(&mut r.dev, 0, 12, 1, 0, 0, true, &page, 1, 1)
            .unwrap();
        assert_eq!(r.cache.lookup(0, 10), Some(0));
        assert_eq!(r.cache.total_dirty(), 2);

        // A second write to lpn 10 coalesces into the same buffer.
        let page2 = full_page(0xBB);
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 0, 0, true, &page2, 2, 1)
            .unwrap();
        assert_eq!(r.cache.total_dirty(), 2);
        assert_eq!(r.cache.entry_epoch(0, 0), 2);
        assert_eq!(r.cache.buf(0, 0)[0], 0xBB);
    }

    #[test]
    fn test_partial_write_fills_between_holes() {
        let mut r = rig();
        // Sector 0 and 3 are holes; sectors 1..3 come from the host.
        let src = vec![0xCCu8; 128];
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 1, 1, true, &src, 1, 1)
            .unwrap();
        let buf = r.cache.buf(0, 0);
        assert_eq!(buf[64], 0xCC);
        assert_eq!(buf[191], 0xCC);
        assert_ne!(buf[0], 0xCC);
    }

    #[test]
    fn test_dequeue_picks_lru_dirty_and_programs() {
        let mut r = rig();
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 0, 0, true, &full_page(1), 1, 1)
            .unwrap();
        r.cache
            .enqueue(&mut r.dev, 0, 12, 1, 0, 0, true, &full_page(2), 1, 1)
            .unwrap();

        let mut ctx = EvictionCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            chlog: &mut r.chlog,
            stats: &mut r.stats,
            epoch: 1,
        };
        // lpn 10 is the older of the two and must be evicted first.
        assert!(!r.cache.dequeue(0, &mut ctx).unwrap());
        let ppn = ctx.pgmap.ppn(10);
        assert_ne!(ppn, 0);
        assert_eq!(ctx.pgmap.ppn(12), 0);
        assert_eq!(ctx.blkmgr.vcount(0, ppn / 8), 1);
        assert_eq!(ctx.chlog.pending_mapents(), 1);
        assert_eq!(r.cache.total_dirty(), 1);
    }

    #[test]
    fn test_dequeue_quiescent_bank() {
        let mut r = rig();
        let mut ctx = EvictionCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            chlog: &mut r.chlog,
            stats: &mut r.stats,
            epoch: 1,
        };
        assert!(r.cache.dequeue(0, &mut ctx).unwrap());
    }

    #[test]
    fn test_flush_all_drains_every_bank() {
        let mut r = rig();
        for lpn in 0..6u32 {
            let bank = lpn % 2;
            let buf_id = (lpn / 2) as usize;
            r.cache
                .enqueue(
                    &mut r.dev,
                    bank,
                    lpn,
                    buf_id,
                    0,
                    0,
                    true,
                    &full_page(lpn as u8),
                    1,
                    1,
                )
                .unwrap();
        }
        let mut ctx = EvictionCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            chlog: &mut r.chlog,
            stats: &mut r.stats,
            epoch: 1,
        };
        r.cache.flush_all(&mut ctx).unwrap();
        assert_eq!(r.cache.total_dirty(), 0);
        for lpn in 0..6u32 {
            assert_ne!(ctx.pgmap.ppn(lpn), 0, "lpn {lpn} never reached flash");
        }
    }

    #[test]
    fn test_clean_buf_evicts_when_full() {
        let mut r = rig();
        for i in 0..4u32 {
            r.cache
                .enqueue(
                    &mut r.dev,
                    0,
                    2 * i,
                    i as usize,
                    0,
                    0,
                    true,
                    &full_page(i as u8),
                    1,
                    1,
                )
                .unwrap();
        }
        let mut ctx = EvictionCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            chlog: &mut r.chlog,
            stats: &mut r.stats,
            epoch: 1,
        };
        let id = r.cache.clean_buf(0, &mut ctx).unwrap();
        assert!(!r.cache.is_dirty(0, id));
    }

    #[test]
    fn test_stall_blocks_eviction() {
        let mut r = rig();
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 0, 0, true, &full_page(9), 1, 1)
            .unwrap();
        r.cache.stall(0);
        let mut ctx = EvictionCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            chlog: &mut r.chlog,
            stats: &mut r.stats,
            epoch: 1,
        };
        assert!(!r.cache.dequeue(0, &mut ctx).unwrap());
        assert_eq!(ctx.pgmap.ppn(10), 0);
        r.cache.release(0);
        while !r.cache.dequeue(0, &mut ctx).unwrap() {}
        assert_ne!(ctx.pgmap.ppn(10), 0);
    }

    #[test]
    fn test_invalidate_range_drops_entries() {
        let mut r = rig();
        r.cache
            .enqueue(&mut r.dev, 0, 10, 0, 0, 0, true, &full_page(1), 1, 1)
            .unwrap();
        r.cache
            .enqueue(&mut r.dev, 0, 20, 1, 0, 0, true, &full_page(2), 1, 1)
            .unwrap();
        r.cache.invalidate_range(8, 8);
        assert_eq!(r.cache.lookup(0, 10), None);
        assert_eq!(r.cache.lookup(0, 20), Some(1));
        assert_eq!(r.cache.total_dirty(), 1);
    }
}
