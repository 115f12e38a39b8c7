// # FTL Dispatcher - Host Command Engine
//
// Accepts host read/write/flush/trim, owns the monotone write epoch, and
// drives the cache, block manager, page map, change log, and GC engine in
// the right order. Single-threaded and cooperative: device parallelism
// comes from the banks, and the explicit wait points below are the only
// places progress depends on an external event. While waiting on one bank
// the dispatcher opportunistically pushes other banks' evictions.
//
// Epoch discipline: the epoch advances exactly once per host write call,
// so an epoch names a whole request. Every page admitted for a request
// carries the request's page span in its spare bytes; recovery uses the
// span to detect torn multi-page writes.

use std::time::Instant;

use tracing::{debug, info};

use crate::blkmgr::BlockManager;
use crate::cache::{EvictionCtx, WriteCache};
use crate::chlog::{ChangeLog, LogCtx};
use crate::error::{FtlError, Result};
use crate::flash::FlashDevice;
use crate::gc::{GcCtx, GcEngine};
use crate::geometry::{Epoch, Geometry};
use crate::layout::{parse_log_page, LogPage};
use crate::pgmap::PageMap;
use crate::recovery;
use crate::stats::FtlStats;
use crate::FtlConfig;

/// One trim extent, in sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimRange {
    pub lba: u32,
    pub n_sect: u32,
}

pub struct Ftl<D: FlashDevice> {
    cfg: FtlConfig,
    geo: Geometry,
    dev: D,
    blkmgr: BlockManager,
    pgmap: PageMap,
    cache: WriteCache,
    chlog: ChangeLog,
    gc: GcEngine,
    stats: FtlStats,
    epoch: Epoch,
    epoch_incomplete: Epoch,
    last_flush: Instant,
}

impl<D: FlashDevice> Ftl<D> {
    /// Bring the device online. A device with a valid map snapshot or any
    /// log evidence goes through restore + recovery; a fresh device is
    /// formatted.
    pub fn open(cfg: FtlConfig, mut dev: D) -> Result<Ftl<D>> {
        cfg.validate()?;
        let geo = cfg.geometry();
        let mut blkmgr = BlockManager::new(&cfg)?;
        let mut pgmap = PageMap::new(geo);

        let restored = pgmap.restore_map(&mut dev, &mut blkmgr)?;

        // Probe for prior log evidence before the cursors touch the area.
        let mut probe = vec![0u8; geo.bytes_per_page()];
        dev.page_read(
            0,
            blkmgr.log_first_blk(0),
            0,
            0,
            geo.sectors_per_page,
            &mut probe,
        )?;
        let has_log = parse_log_page(&probe, geo.banks) != LogPage::End;

        pgmap.init_cursors(&mut blkmgr)?;

        let mut ftl = Ftl {
            cache: WriteCache::new(geo, cfg.cache_bufs_per_bank as usize),
            chlog: ChangeLog::new(&cfg),
            gc: GcEngine::new(geo),
            stats: FtlStats::default(),
            epoch: restored.unwrap_or(0),
            epoch_incomplete: 0,
            last_flush: Instant::now(),
            cfg,
            geo,
            dev,
            blkmgr,
            pgmap,
        };

        if restored.is_none() && !has_log {
            ftl.format()?;
        } else {
            ftl.run_recovery()?;
        }

        info!(
            banks = geo.banks,
            blocks_per_bank = geo.blocks_per_bank,
            pages_per_block = geo.pages_per_block,
            page_bytes = geo.bytes_per_page(),
            logical_pages = geo.logical_pages,
            epoch = ftl.epoch,
            "ftl opened"
        );
        Ok(ftl)
    }

    fn format(&mut self) -> Result<()> {
        info!("fresh device, formatting");
        self.blkmgr.erase_all_blocks(&mut self.dev)?;
        self.dev.flash_finish()?;
        self.epoch = 1;
        self.epoch_incomplete = 1;
        let Self {
            dev,
            blkmgr,
            pgmap,
            chlog,
            stats,
            epoch,
            ..
        } = self;
        let mut ctx = LogCtx {
            dev,
            blkmgr,
            pgmap,
            stats,
        };
        chlog.record_tag(&mut ctx, *epoch)
    }

    fn run_recovery(&mut self) -> Result<()> {
        let Self {
            dev,
            blkmgr,
            pgmap,
            geo,
            epoch,
            ..
        } = self;
        let outcome = recovery::run(dev, geo, blkmgr, pgmap, *epoch)?;
        self.epoch = outcome.epoch_incomplete;
        self.epoch_incomplete = outcome.epoch_incomplete;
        Ok(())
    }

    /// Re-run crash recovery against the current on-flash state. Running
    /// it again without intervening writes is a no-op on the map.
    pub fn recover(&mut self) -> Result<()> {
        self.run_recovery()
    }

    // ------------------------------------------------------------------
    // Host surface
    // ------------------------------------------------------------------

    /// Read `n_sect` sectors starting at `lba` into `out`.
    pub fn read(&mut self, lba: u32, n_sect: u32, out: &mut [u8]) -> Result<()> {
        self.check_host_range(lba, n_sect, out.len())?;
        self.stats.host_sectors_read += u64::from(n_sect);

        let spp = self.geo.sectors_per_page;
        let bps = self.geo.bytes_per_sector as usize;
        let mut remain = n_sect;
        let mut lpn = self.geo.lpn_of(lba);
        let mut base_sect = lba % spp;
        let mut off = 0usize;

        while remain != 0 {
            let cnt = remain.min(spp - base_sect);
            let bank = self.geo.bank_of(lpn);
            let dst = &mut out[off..off + cnt as usize * bps];

            if let Some(buf_id) = self.cache.lookup(bank, lpn) {
                let Self { dev, cache, .. } = self;
                cache.wait_buf_complete(dev, bank, buf_id)?;
                let start = base_sect as usize * bps;
                dst.copy_from_slice(&cache.buf(bank, buf_id)[start..start + dst.len()]);
            } else {
                let ppn = self.pgmap.ppn(lpn);
                if ppn != 0 {
                    self.cache.stall(bank);
                    self.wait_bank_free(bank)?;
                    let blk = self.geo.blk_of(ppn);
                    let page = self.geo.page_of(ppn);
                    self.dev.page_read(bank, blk, page, base_sect, cnt, dst)?;
                    self.cache.release(bank);
                } else {
                    // Never written (or trimmed).
                    dst.fill(0xFF);
                }
            }

            off += cnt as usize * bps;
            base_sect = 0;
            remain -= cnt;
            lpn += 1;
        }
        Ok(())
    }

    /// Write `n_sect` sectors starting at `lba` from `data`.
    pub fn write(&mut self, lba: u32, n_sect: u32, data: &[u8]) -> Result<()> {
        if n_sect == 0 {
            return Ok(());
        }
        self.check_host_range(lba, n_sect, data.len())?;
        self.stats.host_sectors_written += u64::from(n_sect);

        let spp = self.geo.sectors_per_page;
        let bps = self.geo.bytes_per_sector as usize;
        let mut remain = n_sect;
        let mut lpn = self.geo.lpn_of(lba);
        let mut base_sect = lba % spp;
        let mut off = 0usize;

        let lpn_end = self.geo.lpn_of(lba + n_sect - 1);
        let pg_span = (lpn_end - lpn + 1) as u16;

        while remain != 0 {
            self.pool()?;

            let cnt = remain.min(spp - base_sect);
            let bank = self.geo.bank_of(lpn);

            let mut complete = true;
            let buf_id = match self.cache.lookup(bank, lpn) {
                None => {
                    let buf_id = {
                        let Self {
                            dev,
                            blkmgr,
                            pgmap,
                            chlog,
                            cache,
                            stats,
                            epoch,
                            ..
                        } = self;
                        let mut ctx = EvictionCtx {
                            dev,
                            blkmgr,
                            pgmap,
                            chlog,
                            stats,
                            epoch: *epoch,
                        };
                        cache.clean_buf(bank, &mut ctx)?
                    };
                    let ppn = self.pgmap.ppn(lpn);
                    if ppn != 0 && cnt != spp {
                        // Partial update of an existing page: preread the
                        // missing sectors around the host data.
                        let blk = self.geo.blk_of(ppn);
                        let page = self.geo.page_of(ppn);
                        if base_sect == 0 || (base_sect + cnt) % spp == 0 {
                            // Hole on one side only; the preread can
                            // settle while the request continues.
                            complete = false;
                            let base_preread = if base_sect == 0 { cnt } else { 0 };
                            let cnt_preread = spp - cnt;
                            self.cache.stall(bank);
                            self.wait_bank_free(bank)?;
                            {
                                let Self { dev, cache, .. } = self;
                                let start = base_preread as usize * bps;
                                let end = start + cnt_preread as usize * bps;
                                let dst = &mut cache.buf_mut(bank, buf_id)[start..end];
                                dev.page_read(bank, blk, page, base_preread, cnt_preread, dst)?;
                            }
                            self.cache.release(bank);
                        } else {
                            // Interior span: preread the whole page and
                            // wait for it before merging.
                            self.cache.stall(bank);
                            self.wait_bank_free(bank)?;
                            {
                                let Self { dev, cache, .. } = self;
                                let dst = cache.buf_mut(bank, buf_id);
                                dev.page_read(bank, blk, page, 0, spp, dst)?;
                            }
                            self.wait_bank_free(bank)?;
                            self.cache.release(bank);
                        }
                    } else if ppn == 0 && cnt != spp {
                        // Partial write to a never-written page: the
                        // uncovered sectors read back as erased flash.
                        self.cache.buf_mut(bank, buf_id).fill(0xFF);
                    }
                    buf_id
                }
                Some(buf_id) => {
                    if self.cache.is_dirty(bank, buf_id) {
                        // Overwriting data that never reached flash: record
                        // the hazard so recovery can tie the epochs.
                        let src = self.cache.entry_epoch(bank, buf_id);
                        let span = self.cache.entry_pg_span(bank, buf_id);
                        self.chlog.push_dep(src, self.epoch, span);
                        if self.chlog.depents_full() {
                            self.record_depent()?;
                        }
                    }
                    buf_id
                }
            };

            let src = &data[off..off + cnt as usize * bps];
            {
                let Self {
                    dev, cache, epoch, ..
                } = self;
                cache.enqueue(
                    dev,
                    bank,
                    lpn,
                    buf_id,
                    base_sect,
                    spp - (base_sect + cnt),
                    complete,
                    src,
                    *epoch,
                    pg_span,
                )?;
            }

            off += cnt as usize * bps;
            base_sect = 0;
            remain -= cnt;
            lpn += 1;
        }

        self.epoch += 1;

        if self.blkmgr.batch_gc_needed() {
            let drained = self.prefix_flush()?;
            debug!(drained, "cache drained ahead of batch GC");
            let Self {
                dev,
                blkmgr,
                pgmap,
                chlog,
                gc,
                stats,
                epoch,
                ..
            } = self;
            let mut ctx = GcCtx {
                dev,
                blkmgr,
                pgmap,
                chlog,
                stats,
                epoch: *epoch,
            };
            gc.run_batch(&mut ctx)?;
        }

        if self.chlog.chkpt_needed(&self.blkmgr) {
            self.stats.checkpoints += 1;
            self.prefix_flush()?;
            self.checkpoint()?;
        }

        if self.chlog.flush_depent_scheduled() {
            self.prefix_flush()?;
        }

        if self.cfg.auto_flush_secs != 0
            && self.last_flush.elapsed().as_secs() >= u64::from(self.cfg.auto_flush_secs)
        {
            self.flush()?;
        }
        Ok(())
    }

    /// Durability barrier: drain every dirty cache entry and any pending
    /// dependency page, then wait for the device.
    pub fn flush(&mut self) -> Result<()> {
        self.stats.flushes += 1;
        self.prefix_flush()?;
        self.last_flush = Instant::now();
        Ok(())
    }

    /// Clear the mapping of every logical page fully covered by a range.
    pub fn trim(&mut self, ranges: &[TrimRange]) -> Result<()> {
        let spp = self.geo.sectors_per_page;
        for r in ranges {
            self.check_host_range(r.lba, r.n_sect, usize::MAX)?;
            let lpn = r.lba.div_ceil(spp);
            let lpn_end = (r.lba + r.n_sect) / spp;
            if lpn_end > lpn {
                self.pgmap.trim(lpn, lpn_end - lpn);
                self.cache.invalidate_range(lpn, lpn_end - lpn);
            }
        }
        Ok(())
    }

    /// Shut down cleanly: flush, checkpoint, persist the map, and retire
    /// the log. The final snapshot supersedes every log page, and leaving
    /// them behind would let a later recovery replay deltas older than
    /// the snapshot (resurrecting trimmed mappings, among other things).
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.checkpoint()?;
        let Self {
            dev,
            blkmgr,
            pgmap,
            epoch,
            ..
        } = &mut self;
        pgmap.persist_map(dev, blkmgr, *epoch)?;
        blkmgr.erase_log_area(dev)?;
        dev.flash_finish()?;
        info!(
            wa = self.stats.write_amplification(),
            flushes = self.stats.flushes,
            checkpoints = self.stats.checkpoints,
            "ftl closed"
        );
        Ok(())
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// First epoch recovery found not fully durable, from the last
    /// recovery run.
    pub fn epoch_incomplete(&self) -> Epoch {
        self.epoch_incomplete
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_host_range(&self, lba: u32, n_sect: u32, buf_len: usize) -> Result<()> {
        let end = u64::from(lba) + u64::from(n_sect);
        if end > self.geo.logical_sectors() {
            return Err(FtlError::HostMisuse(format!(
                "sector range {lba}..{end} exceeds device capacity"
            )));
        }
        let want = n_sect as usize * self.geo.bytes_per_sector as usize;
        if buf_len != usize::MAX && buf_len != want {
            return Err(FtlError::HostMisuse(format!(
                "buffer is {buf_len} bytes for a {want}-byte transfer"
            )));
        }
        Ok(())
    }

    /// Drain the cache and pending dependency records. Returns how many
    /// dirty buffers were flushed.
    pub fn prefix_flush(&mut self) -> Result<u32> {
        let dirty = self.cache.total_dirty();
        self.record_depent()?;
        let Self {
            dev,
            blkmgr,
            pgmap,
            chlog,
            cache,
            stats,
            epoch,
            ..
        } = self;
        let mut ctx = EvictionCtx {
            dev,
            blkmgr,
            pgmap,
            chlog,
            stats,
            epoch: *epoch,
        };
        cache.flush_all(&mut ctx)?;
        Ok(dirty)
    }

    fn record_depent(&mut self) -> Result<()> {
        let Self {
            dev,
            blkmgr,
            pgmap,
            chlog,
            stats,
            ..
        } = self;
        let mut ctx = LogCtx {
            dev,
            blkmgr,
            pgmap,
            stats,
        };
        chlog.record_depent(&mut ctx)
    }

    /// Persist accumulated map deltas and the commit tag.
    fn checkpoint(&mut self) -> Result<()> {
        let Self {
            dev,
            blkmgr,
            pgmap,
            chlog,
            stats,
            epoch,
            ..
        } = self;
        let mut ctx = LogCtx {
            dev,
            blkmgr,
            pgmap,
            stats,
        };
        chlog.record_mapent(&mut ctx)?;
        chlog.record_tag(&mut ctx, *epoch)
    }

    /// One round-robin background step: push an eviction or erase a parked
    /// GC victim on the next bank.
    fn pool(&mut self) -> Result<()> {
        let Self {
            dev,
            blkmgr,
            pgmap,
            chlog,
            cache,
            stats,
            epoch,
            ..
        } = self;
        let mut ctx = EvictionCtx {
            dev,
            blkmgr,
            pgmap,
            chlog,
            stats,
            epoch: *epoch,
        };
        cache.pool(&mut ctx)
    }

    /// Spin until a bank is idle, opportunistically running other banks'
    /// background work.
    fn wait_bank_free(&mut self, bank: u32) -> Result<()> {
        const MAX_POLLS: u32 = 1 << 20;
        for _ in 0..MAX_POLLS {
            if self.dev.bank_idle(bank) {
                return Ok(());
            }
            self.pool()?;
        }
        Err(FtlError::DeviceTimeout(bank))
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    pub fn stats(&self) -> &FtlStats {
        &self.stats
    }

    pub fn config(&self) -> &FtlConfig {
        &self.cfg
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.blkmgr
    }

    pub fn page_map(&self) -> &PageMap {
        &self.pgmap
    }

    pub fn write_cache(&self) -> &WriteCache {
        &self.cache
    }
}
