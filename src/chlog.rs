// Change log and checkpointer.
//
// Map deltas and RAW-dependency records accumulate in memory between
// barriers and are persisted as MAPENT / DEPENT pages over the dedicated
// log-block ring, fanned out round-robin across banks. A commit tag page
// makes every epoch up to its recorded one durable. When the log area runs
// low the whole map is snapshotted through the page map and the log ring is
// erased and restarted.

use tracing::{debug, info};

use crate::blkmgr::BlockManager;
use crate::error::Result;
use crate::flash::FlashDevice;
use crate::geometry::{Epoch, Geometry, Lpn, Ppn};
use crate::layout::{
    encode_depent_page, encode_mapent_page, CommitRecord, DepRecord, PageTag,
};
use crate::pgmap::PageMap;
use crate::stats::FtlStats;
use crate::FtlConfig;

/// Collaborators a log-page persist touches.
pub struct LogCtx<'a, D: FlashDevice> {
    pub dev: &'a mut D,
    pub blkmgr: &'a mut BlockManager,
    pub pgmap: &'a mut PageMap,
    pub stats: &'a mut FtlStats,
}

pub struct ChangeLog {
    geo: Geometry,
    mapents: Vec<(Lpn, Ppn)>,
    deps: Vec<DepRecord>,
    /// Round-robin destination bank for the next log page.
    bank_active: u32,
    require_flush_depent: bool,
    num_mapents_per_page: usize,
    num_depents_per_page: usize,
    chkpt_mapent_slack: usize,
}

impl ChangeLog {
    pub fn new(cfg: &FtlConfig) -> ChangeLog {
        ChangeLog {
            geo: cfg.geometry(),
            mapents: Vec::new(),
            deps: Vec::new(),
            bank_active: 0,
            require_flush_depent: false,
            num_mapents_per_page: cfg.num_mapents_per_page as usize,
            num_depents_per_page: cfg.num_depents_per_page as usize,
            chkpt_mapent_slack: cfg.chkpt_mapent_slack as usize,
        }
    }

    // ------------------------------------------------------------------
    // Accumulators
    // ------------------------------------------------------------------

    pub fn push_mapent(&mut self, lpn: Lpn, ppn: Ppn) {
        self.mapents.push((lpn, ppn));
    }

    pub fn push_dep(&mut self, src: Epoch, dst: Epoch, pg_span: u16) {
        self.deps.push(DepRecord {
            src,
            dst,
            pg_span: u32::from(pg_span),
        });
    }

    pub fn depents_full(&self) -> bool {
        self.deps.len() >= self.num_depents_per_page
    }

    pub fn pending_mapents(&self) -> usize {
        self.mapents.len()
    }

    pub fn pending_deps(&self) -> usize {
        self.deps.len()
    }

    pub fn schedule_flush_depent(&mut self) {
        self.require_flush_depent = true;
    }

    pub fn flush_depent_scheduled(&self) -> bool {
        self.require_flush_depent
    }

    /// Checkpoint when the accumulated deltas would no longer fit the
    /// per-barrier page budget, or when the log area itself runs low.
    pub fn chkpt_needed(&self, blkmgr: &BlockManager) -> bool {
        let budget = ((self.geo.banks as usize - 1) * self.num_mapents_per_page)
            .saturating_sub(self.chkpt_mapent_slack);
        self.mapents.len() > budget || blkmgr.log_reclaim_needed()
    }

    // ------------------------------------------------------------------
    // Page persistence
    // ------------------------------------------------------------------

    fn program_log_page<D: FlashDevice>(
        &mut self,
        ctx: &mut LogCtx<'_, D>,
        buf: &[u8],
    ) -> Result<()> {
        let bank = self.bank_active;
        let ppn = ctx.pgmap.alloc_log_ppn(bank, ctx.blkmgr)?;
        ctx.dev.page_program(
            bank,
            self.geo.blk_of(ppn),
            self.geo.page_of(ppn),
            buf,
            &PageTag::Erased,
        )?;
        self.bank_active = (bank + 1) % self.geo.banks;
        Ok(())
    }

    /// Persist every accumulated map delta as MAPENT pages.
    pub fn record_mapent<D: FlashDevice>(&mut self, ctx: &mut LogCtx<'_, D>) -> Result<()> {
        if self.mapents.is_empty() {
            return Ok(());
        }
        let pairs = std::mem::take(&mut self.mapents);
        let mut buf = vec![0u8; self.geo.bytes_per_page()];
        for chunk in pairs.chunks(self.num_mapents_per_page) {
            encode_mapent_page(chunk, &mut buf);
            ctx.stats.mapent_pages += 1;
            self.program_log_page(ctx, &buf)?;
        }
        debug!(pairs = pairs.len(), "map deltas recorded");
        Ok(())
    }

    /// Persist the accumulated dependency records, if any.
    pub fn record_depent<D: FlashDevice>(&mut self, ctx: &mut LogCtx<'_, D>) -> Result<()> {
        self.require_flush_depent = false;
        if self.deps.is_empty() {
            return Ok(());
        }
        let deps = std::mem::take(&mut self.deps);
        let mut buf = vec![0u8; self.geo.bytes_per_page()];
        encode_depent_page(&deps, &mut buf);
        ctx.stats.depent_pages += 1;
        ctx.stats.dep_records += deps.len() as u64;
        self.program_log_page(ctx, &buf)?;
        debug!(records = deps.len(), "dependency records recorded");
        Ok(())
    }

    /// Write the commit tag: freeze the just-closed epoch's blocks against
    /// GC, quiesce, then record `epoch - 1` and the active cursors. If the
    /// log area is nearly exhausted this also performs reclamation: a full
    /// map snapshot, log-area erase, cursor reset, and a fresh tag.
    pub fn record_tag<D: FlashDevice>(
        &mut self,
        ctx: &mut LogCtx<'_, D>,
        epoch: Epoch,
    ) -> Result<()> {
        loop {
            ctx.blkmgr.reserve_barrier();
            ctx.dev.flash_finish()?;

            let rec = CommitRecord {
                epoch: epoch.wrapping_sub(1),
                active_ppns: ctx.pgmap.active_ppns().to_vec(),
            };
            let mut buf = vec![0u8; self.geo.bytes_per_page()];
            rec.encode_into(&mut buf);
            ctx.stats.commit_tags += 1;
            self.program_log_page(ctx, &buf)?;
            ctx.dev.flash_finish()?;

            if !ctx.blkmgr.log_reclaim_needed() {
                return Ok(());
            }

            info!("log area low, reclaiming");
            ctx.stats.log_reclaims += 1;
            ctx.stats.map_snapshots += 1;
            ctx.pgmap.persist_map(ctx.dev, ctx.blkmgr, epoch)?;
            ctx.blkmgr.erase_log_area(ctx.dev)?;
            for bank in 0..self.geo.banks {
                ctx.pgmap.revert_log_cursor(bank, ctx.blkmgr)?;
            }
            self.bank_active = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;
    use crate::layout::{parse_log_page, LogPage};
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
        chlog: ChangeLog,
        dev: SimFlash,
        blkmgr: BlockManager,
        pgmap: PageMap,
        stats: FtlStats,
    }

    fn rig() -> Rig {
        let c = cfg();
        let geo = c.geometry();
        let mut blkmgr = BlockManager::new(&c).unwrap();
        let mut pgmap = PageMap::new(geo);
        pgmap.init_cursors(&mut blkmgr).unwrap();
        Rig {
            chlog: ChangeLog::new(&c),
            dev: SimFlash::new(geo),
            blkmgr,
            pgmap,
            stats: FtlStats::default(),
        }
    }

    #[test]
    fn test_mapents_chunk_into_pages() {
        let mut r = rig();
        for i in 0..20u32 {
            r.chlog.push_mapent(i, 100 + i);
        }
        let mut ctx = LogCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            stats: &mut r.stats,
        };
        r.chlog.record_mapent(&mut ctx).unwrap();
        assert_eq!(r.chlog.pending_mapents(), 0);
        // 20 pairs at 16 per page: one full page on bank 0, the remainder
        // on bank 1.
        assert_eq!(r.stats.mapent_pages, 2);

        let first_log = r.blkmgr.log_first_blk(0);
        let mut buf = vec![0u8; 256];
        r.dev.page_read(0, first_log, 0, 0, 4, &mut buf).unwrap();
        match parse_log_page(&buf, 2) {
            LogPage::MapEnts(pairs) => {
                assert_eq!(pairs.len(), 16);
                assert_eq!(pairs[0], (0, 100));
            }
            other => panic!("expected MAPENT page, got {other:?}"),
        }
    }

    #[test]
    fn test_depent_page_round_robin() {
        let mut r = rig();
        r.chlog.push_dep(3, 5, 2);
        r.chlog.push_dep(4, 5, 1);
        assert!(!r.chlog.depents_full());
        let mut ctx = LogCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            stats: &mut r.stats,
        };
        r.chlog.record_depent(&mut ctx).unwrap();
        assert_eq!(r.chlog.pending_deps(), 0);

        let first_log = r.blkmgr.log_first_blk(0);
        let mut buf = vec![0u8; 256];
        r.dev.page_read(0, first_log, 0, 0, 4, &mut buf).unwrap();
        match parse_log_page(&buf, 2) {
            LogPage::DepEnts(deps) => {
                assert_eq!(deps.len(), 2);
                assert_eq!(
                    deps[0],
                    DepRecord {
                        src: 3,
                        dst: 5,
                        pg_span: 2
                    }
                );
            }
            other => panic!("expected DEPENT page, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_depent_writes_nothing() {
        let mut r = rig();
        r.chlog.schedule_flush_depent();
        assert!(r.chlog.flush_depent_scheduled());
        let before = r.dev.program_ops();
        let mut ctx = LogCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            stats: &mut r.stats,
        };
        r.chlog.record_depent(&mut ctx).unwrap();
        assert!(!r.chlog.flush_depent_scheduled());
        assert_eq!(r.dev.program_ops(), before);
    }

    #[test]
    fn test_commit_tag_snapshots_cursors() {
        let mut r = rig();
        let mut ctx = LogCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            stats: &mut r.stats,
        };
        r.chlog.record_tag(&mut ctx, 7).unwrap();

        let first_log = r.blkmgr.log_first_blk(0);
        let mut buf = vec![0u8; 256];
        r.dev.page_read(0, first_log, 0, 0, 4, &mut buf).unwrap();
        match parse_log_page(&buf, 2) {
            LogPage::Commit(rec) => {
                assert_eq!(rec.epoch, 6);
                assert_eq!(rec.active_ppns.len(), 2);
                assert_eq!(rec.active_ppns, r.pgmap.active_ppns().to_vec());
            }
            other => panic!("expected COMMIT page, got {other:?}"),
        }
    }

    #[test]
    fn test_chkpt_threshold() {
        let r = rig();
        let mut chlog = r.chlog;
        // Budget is (banks - 1) * mapents_per_page = 16 pairs.
        for i in 0..16u32 {
            chlog.push_mapent(i, i);
        }
        assert!(!chlog.chkpt_needed(&r.blkmgr));
        chlog.push_mapent(99, 99);
        assert!(chlog.chkpt_needed(&r.blkmgr));
    }

    #[test]
    fn test_log_reclamation_resets_ring() {
        let mut r = rig();
        // Burn through log pages until the reclaim threshold trips. Each
        // bank has 2 log blocks and the counter starts with both banks'
        // first blocks consumed by cursor setup.
        let mut epoch = 2u32;
        let mut guard = 0;
        while !r.blkmgr.log_reclaim_needed() {
            let mut ctx = LogCtx {
                dev: &mut r.dev,
                blkmgr: &mut r.blkmgr,
                pgmap: &mut r.pgmap,
                stats: &mut r.stats,
            };
            r.chlog.push_mapent(1, epoch);
            r.chlog.record_mapent(&mut ctx).unwrap();
            epoch += 1;
            guard += 1;
            assert!(guard < 100, "reclaim threshold never tripped");
        }
        let mut ctx = LogCtx {
            dev: &mut r.dev,
            blkmgr: &mut r.blkmgr,
            pgmap: &mut r.pgmap,
            stats: &mut r.stats,
        };
        r.chlog.record_tag(&mut ctx, epoch).unwrap();
        assert_eq!(r.stats.log_reclaims, 1);
        assert_eq!(r.stats.map_snapshots, 1);
        assert!(!r.blkmgr.log_reclaim_needed());
        // The fresh tag landed at the start of the erased log area.
        let first_log = r.blkmgr.log_first_blk(0);
        let mut buf = vec![0u8; 256];
        r.dev.page_read(0, first_log, 0, 0, 4, &mut buf).unwrap();
        assert!(matches!(parse_log_page(&buf, 2), LogPage::Commit(_)));
    }
}
