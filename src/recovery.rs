// # Recovery - Prefix-Consistent Map Reconstruction
//
// Rebuilds the L2P after a crash from three kinds of evidence:
//
//   1. the change log (MAPENT deltas up to the last COMMIT tag),
//   2. the spare-area epochs of every data page written after that commit,
//      reached by chaining blocks through their summary pages from the
//      cursors the commit recorded,
//   3. the DEPENT records witnessing read-after-write hazards that rode
//      through the cache.
//
// The analyze phase determines the first epoch that is not fully durable:
// the smallest post-commit epoch whose observed page count disagrees with
// its recorded span, then lowered along dependency edges so that no epoch
// built on discarded data survives. The rebuild phase installs every page
// older than that epoch, newest copy per lpn winning.
//
// The log is traversed in the same bank round-robin order it was written,
// so "forward" here reproduces the writer's append order exactly.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::blkmgr::BlockManager;
use crate::error::{FtlError, Result};
use crate::flash::FlashDevice;
use crate::geometry::{Epoch, Geometry, Ppn, NUM_REGIONS};
use crate::layout::{parse_log_page, CommitRecord, LogPage, PageTag, SummaryPage};
use crate::pgmap::PageMap;

#[derive(Debug, Clone, Copy)]
pub struct RecoveryOutcome {
    pub epoch_commit: Epoch,
    pub epoch_max: Epoch,
    pub epoch_incomplete: Epoch,
}

#[derive(Clone, Copy, PartialEq)]
enum ChainMode {
    /// Build the per-epoch (span, observed) table; apply GC survivors.
    Collect,
    /// Install pages below the incomplete epoch, newest per lpn.
    Rebuild,
}

struct Recovery {
    epoch_commit: Epoch,
    epoch_max: Epoch,
    epoch_incomplete: Epoch,
    active_ppns: Vec<[Ppn; NUM_REGIONS]>,
    /// Per-epoch expected page span and observed page count, keyed by
    /// epoch, for epochs after the last commit.
    table: HashMap<Epoch, (u32, u32)>,
    deps: Vec<(Epoch, Epoch)>,
}

impl Recovery {
    fn apply_commit(&mut self, rec: &CommitRecord) {
        self.epoch_commit = rec.epoch;
        self.epoch_max = rec.epoch;
        self.epoch_incomplete = rec.epoch + 1;
        self.active_ppns = rec.active_ppns.clone();
    }

    fn add_ent(&mut self, epoch: Epoch, pg_span: u32) {
        if epoch > self.epoch_max {
            self.epoch_max = epoch;
        }
        let ent = self.table.entry(epoch).or_insert((0, 0));
        ent.0 = pg_span;
        ent.1 += 1;
    }

    fn find_first_incomplete(&mut self) {
        let mut idx = 1u32;
        while self.epoch_commit + idx <= self.epoch_max {
            match self.table.get(&(self.epoch_commit + idx)) {
                Some(&(span, cnt)) if span != 0 && span == cnt => idx += 1,
                _ => break,
            }
        }
        self.epoch_incomplete = self.epoch_commit + idx;
    }
}

/// Round-robin log reader. Consumes log pages through the page map's
/// cursors in the order the checkpointer wrote them.
struct LogWalker {
    bank: u32,
}

impl LogWalker {
    fn next<D: FlashDevice>(
        &mut self,
        dev: &mut D,
        geo: &Geometry,
        blkmgr: &mut BlockManager,
        pgmap: &mut PageMap,
        buf: &mut [u8],
    ) -> Result<LogPage> {
        let bank = self.bank;
        self.bank = (self.bank + 1) % geo.banks;
        let ppn = match pgmap.alloc_log_ppn(bank, blkmgr) {
            Ok(ppn) => ppn,
            // Walking off the end of the log area is simply the end of
            // this bank's evidence.
            Err(FtlError::LogExhausted(_)) => return Ok(LogPage::End),
            Err(e) => return Err(e),
        };
        match dev.page_read(
            bank,
            geo.blk_of(ppn),
            geo.page_of(ppn),
            0,
            geo.sectors_per_page,
            buf,
        ) {
            Ok(()) => Ok(parse_log_page(buf, geo.banks)),
            Err(FtlError::Ecc { .. }) => {
                warn!(bank, ppn, "unreadable log page ends traversal");
                Ok(LogPage::End)
            }
            Err(e) => Err(e),
        }
    }
}

fn revert_all(geo: &Geometry, blkmgr: &mut BlockManager, pgmap: &mut PageMap) -> Result<()> {
    blkmgr.reset_log_counter();
    for bank in 0..geo.banks {
        pgmap.revert_log_cursor(bank, blkmgr)?;
    }
    Ok(())
}

/// Park every log cursor exactly on its bank's first erased page so that
/// appending resumes without leaving holes a later traversal would mistake
/// for the end of the log.
fn park_log_cursors<D: FlashDevice>(
    dev: &mut D,
    geo: &Geometry,
    blkmgr: &mut BlockManager,
    pgmap: &mut PageMap,
    buf: &mut [u8],
) -> Result<()> {
    blkmgr.reset_log_counter();
    for bank in 0..geo.banks {
        pgmap.revert_log_cursor(bank, blkmgr)?;
        loop {
            let ppn = match pgmap.alloc_log_ppn(bank, blkmgr) {
                Ok(ppn) => ppn,
                Err(FtlError::LogExhausted(_)) => break,
                Err(e) => return Err(e),
            };
            dev.page_read(
                bank,
                geo.blk_of(ppn),
                geo.page_of(ppn),
                0,
                geo.sectors_per_page,
                buf,
            )?;
            if parse_log_page(buf, geo.banks) == LogPage::End {
                pgmap.set_log_cursor(bank, ppn);
                break;
            }
        }
    }
    Ok(())
}

/// Run full crash recovery. `start_epoch` is the epoch restored from the
/// map snapshot (0 when no snapshot existed). On return the in-memory L2P
/// reflects the largest prefix-closed set of host writes supported by the
/// on-flash evidence, and the log cursors rest past the last written log
/// page so appending can resume.
pub fn run<D: FlashDevice>(
    dev: &mut D,
    geo: &Geometry,
    blkmgr: &mut BlockManager,
    pgmap: &mut PageMap,
    start_epoch: Epoch,
) -> Result<RecoveryOutcome> {
    let mut rec = Recovery {
        epoch_commit: start_epoch,
        epoch_max: start_epoch,
        epoch_incomplete: start_epoch + 1,
        active_ppns: vec![[0; NUM_REGIONS]; geo.banks as usize],
        table: HashMap::new(),
        deps: Vec::new(),
    };
    let mut buf = vec![0u8; geo.bytes_per_page()];

    // --- Analyze, pass 1: find the last commit tag. -------------------
    revert_all(geo, blkmgr, pgmap)?;
    let mut walker = LogWalker { bank: 0 };
    let mut found_commit = false;
    loop {
        match walker.next(dev, geo, blkmgr, pgmap, &mut buf)? {
            LogPage::Commit(c) => {
                found_commit = true;
                rec.apply_commit(&c);
            }
            LogPage::MapEnts(_) | LogPage::DepEnts(_) => {}
            LogPage::End => break,
        }
    }
    if !found_commit {
        // The snapshot alone is the recovered state. This happens when a
        // fresh snapshot landed but its first commit page did not.
        info!(epoch = rec.epoch_commit, "no commit page after snapshot");
        park_log_cursors(dev, geo, blkmgr, pgmap, &mut buf)?;
        return Ok(RecoveryOutcome {
            epoch_commit: rec.epoch_commit,
            epoch_max: rec.epoch_max,
            epoch_incomplete: rec.epoch_incomplete,
        });
    }
    debug!(epoch = rec.epoch_commit, "last commit located");

    // --- Analyze, pass 2: replay MAPENTs up to the last commit, then
    // scan the post-commit data chains and the trailing DEPENT run. ----
    revert_all(geo, blkmgr, pgmap)?;
    let mut walker = LogWalker { bank: 0 };
    loop {
        match walker.next(dev, geo, blkmgr, pgmap, &mut buf)? {
            LogPage::Commit(c) => {
                if c.epoch == rec.epoch_commit {
                    break;
                }
            }
            LogPage::MapEnts(pairs) => {
                for (lpn, ppn) in pairs {
                    pgmap.set_ppn(lpn, ppn);
                }
            }
            LogPage::DepEnts(_) => {}
            LogPage::End => break,
        }
    }
    let active = rec.active_ppns.clone();
    for bank in 0..geo.banks {
        for region in 0..NUM_REGIONS {
            walk_chain(
                dev,
                geo,
                pgmap,
                &mut rec,
                bank,
                active[bank as usize][region],
                ChainMode::Collect,
                &mut [],
            )?;
        }
    }
    loop {
        match walker.next(dev, geo, blkmgr, pgmap, &mut buf)? {
            LogPage::DepEnts(deps) => {
                for d in deps {
                    if d.src > rec.epoch_commit {
                        rec.add_ent(d.src, d.pg_span);
                    } else {
                        warn!(src = d.src, "dependency source below committed epoch");
                    }
                }
            }
            _ => break,
        }
    }

    // --- Analyze, pass 3: first incomplete epoch, then pull it down
    // along recorded dependency edges. ---------------------------------
    rec.find_first_incomplete();
    revert_all(geo, blkmgr, pgmap)?;
    let mut walker = LogWalker { bank: 0 };
    loop {
        match walker.next(dev, geo, blkmgr, pgmap, &mut buf)? {
            LogPage::Commit(c) if c.epoch == rec.epoch_commit => break,
            LogPage::End => break,
            _ => {}
        }
    }
    loop {
        match walker.next(dev, geo, blkmgr, pgmap, &mut buf)? {
            LogPage::DepEnts(deps) => {
                for d in deps {
                    rec.deps.push((d.src, d.dst));
                }
            }
            _ => break,
        }
    }
    rec.deps.sort_by_key(|&(src, _)| src);
    for &(src, dst) in rec.deps.iter().rev() {
        if src < rec.epoch_incomplete && dst >= rec.epoch_incomplete {
            rec.epoch_incomplete = src;
        }
    }
    info!(
        commit = rec.epoch_commit,
        max = rec.epoch_max,
        incomplete = rec.epoch_incomplete,
        deps = rec.deps.len(),
        "analysis done"
    );

    // --- Rebuild: install every page strictly below the incomplete
    // epoch, newest epoch per lpn winning. ------------------------------
    let mut best = vec![0u32; geo.logical_pages as usize];
    for bank in 0..geo.banks {
        for region in 0..NUM_REGIONS {
            walk_chain(
                dev,
                geo,
                pgmap,
                &mut rec,
                bank,
                active[bank as usize][region],
                ChainMode::Rebuild,
                &mut best,
            )?;
        }
    }

    park_log_cursors(dev, geo, blkmgr, pgmap, &mut buf)?;
    info!("rebuild done");

    Ok(RecoveryOutcome {
        epoch_commit: rec.epoch_commit,
        epoch_max: rec.epoch_max,
        epoch_incomplete: rec.epoch_incomplete,
    })
}

/// Walk one (bank, region) chain of data blocks from the cursor recorded
/// in the last commit, following the next-block pointer in each summary
/// page. An erased page ends the in-block scan; an unreadable or erased
/// summary ends the chain.
#[allow(clippy::too_many_arguments)]
fn walk_chain<D: FlashDevice>(
    dev: &mut D,
    geo: &Geometry,
    pgmap: &mut PageMap,
    rec: &mut Recovery,
    bank: u32,
    start_ppn: Ppn,
    mode: ChainMode,
    best: &mut [u32],
) -> Result<()> {
    let ppb = geo.pages_per_block;
    let mut blk = geo.blk_of(start_ppn);
    let mut page = geo.page_of(start_ppn);
    if blk >= geo.blocks_per_bank {
        return Ok(());
    }

    let bps = geo.bytes_per_sector as usize;
    let summary_len = SummaryPage::byte_len(ppb).div_ceil(bps) * bps;
    let mut summary_buf = vec![0u8; summary_len];

    loop {
        while page < ppb - 1 {
            let tag = match dev.read_spare(bank, blk, page) {
                Ok(tag) => tag,
                Err(FtlError::Ecc { .. }) => {
                    warn!(bank, blk, page, "unreadable page ends chain walk");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            match tag {
                PageTag::Erased => break,
                PageTag::GcSurvivor { lpn } => {
                    if mode == ChainMode::Collect {
                        pgmap.set_ppn(lpn, geo.ppn(blk, page));
                    }
                }
                PageTag::HostWrite {
                    lpn,
                    pg_span,
                    epoch,
                } => match mode {
                    ChainMode::Collect => {
                        if epoch > rec.epoch_commit {
                            rec.add_ent(epoch, u32::from(pg_span));
                        }
                    }
                    ChainMode::Rebuild => {
                        let idx = lpn as usize;
                        if epoch < rec.epoch_incomplete
                            && idx < best.len()
                            && epoch > best[idx]
                        {
                            pgmap.set_ppn(lpn, geo.ppn(blk, page));
                            best[idx] = epoch;
                        }
                    }
                },
            }
            page += 1;
        }

        match dev.page_read(
            bank,
            blk,
            ppb - 1,
            0,
            (summary_len / bps) as u32,
            &mut summary_buf,
        ) {
            Ok(()) => {}
            Err(FtlError::Ecc { .. }) => {
                warn!(bank, blk, "unreadable summary ends chain walk");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        let summary = SummaryPage::decode(&summary_buf, ppb);
        if summary.next_block >= geo.blocks_per_bank {
            return Ok(());
        }
        blk = summary.next_block;
        page = 0;
    }
}
