// # Page Map - Logical-to-Physical Mapping
//
// Owns the L2P table, the in-memory reverse-map slots for every open
// (bank, region) block, per-block birth epochs, the per-region active write
// cursors, and the per-bank log cursors. Persists itself with shadow paging
// over the two reserved map blocks per bank.

use tracing::{debug, info};

use crate::blkmgr::BlockManager;
use crate::error::{FtlError, Result};
use crate::flash::{wait_bank_idle, FlashDevice};
use crate::geometry::{Epoch, Geometry, Lpn, Ppn, NUM_REGIONS};
use crate::layout::{
    decode_map_commit_page, encode_map_commit_page, PageTag, SummaryPage,
};

pub struct PageMap {
    geo: Geometry,
    l2p: Vec<Ppn>,
    /// Reverse-map slots of the open block, per (bank, region).
    lpns: Vec<Lpn>,
    /// Epoch at which each block last became active.
    blk_time: Vec<Epoch>,
    active_ppns: Vec<[Ppn; NUM_REGIONS]>,
    log_ppns: Vec<Ppn>,
}

impl PageMap {
    pub fn new(geo: Geometry) -> PageMap {
        PageMap {
            geo,
            l2p: vec![0; geo.logical_pages as usize],
            lpns: vec![0; (geo.banks as usize) * NUM_REGIONS * geo.pages_per_block as usize],
            blk_time: vec![0; (geo.banks * geo.blocks_per_bank) as usize],
            active_ppns: vec![[0; NUM_REGIONS]; geo.banks as usize],
            log_ppns: vec![0; geo.banks as usize],
        }
    }

    /// Open the first active block of every region and the first log block
    /// of every bank. Must run after the block manager has carved pools.
    pub fn init_cursors(&mut self, blkmgr: &mut BlockManager) -> Result<()> {
        for bank in 0..self.geo.banks {
            for region in 0..NUM_REGIONS {
                let blk = blkmgr.allocate_active(bank, region)?;
                self.active_ppns[bank as usize][region] = blk * self.geo.pages_per_block;
            }
            let log_blk = blkmgr.allocate_log(bank)?;
            self.log_ppns[bank as usize] = log_blk * self.geo.pages_per_block;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // L2P
    // ------------------------------------------------------------------

    /// `0` means never written (or trimmed). Out-of-range reads fold into
    /// the same "never written" answer.
    #[inline]
    pub fn ppn(&self, lpn: Lpn) -> Ppn {
        self.l2p.get(lpn as usize).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set_ppn(&mut self, lpn: Lpn, ppn: Ppn) {
        if let Some(slot) = self.l2p.get_mut(lpn as usize) {
            *slot = ppn;
        }
    }

    pub fn trim(&mut self, lpn: Lpn, n_pages: u32) {
        for p in lpn..lpn.saturating_add(n_pages) {
            self.set_ppn(p, 0);
        }
    }

    /// Live mappings, for debugging and invariant checks.
    pub fn live_mappings(&self) -> impl Iterator<Item = (Lpn, Ppn)> + '_ {
        self.l2p
            .iter()
            .enumerate()
            .filter(|(_, &ppn)| ppn != 0)
            .map(|(lpn, &ppn)| (lpn as Lpn, ppn))
    }

    // ------------------------------------------------------------------
    // Reverse map and birth epochs
    // ------------------------------------------------------------------

    #[inline]
    fn lpn_slot_idx(&self, bank: u32, region: usize, page: u32) -> usize {
        (bank as usize * NUM_REGIONS + region) * self.geo.pages_per_block as usize
            + page as usize
    }

    pub fn set_lpn_slot(&mut self, bank: u32, region: usize, page: u32, lpn: Lpn) {
        let idx = self.lpn_slot_idx(bank, region, page);
        self.lpns[idx] = lpn;
    }

    pub fn lpn_slot(&self, bank: u32, region: usize, page: u32) -> Lpn {
        self.lpns[self.lpn_slot_idx(bank, region, page)]
    }

    pub fn blk_birth_epoch(&self, bank: u32, blk: u32) -> Epoch {
        self.blk_time[(bank * self.geo.blocks_per_bank + blk) as usize]
    }

    fn set_blk_birth_epoch(&mut self, bank: u32, blk: u32, epoch: Epoch) {
        self.blk_time[(bank * self.geo.blocks_per_bank + blk) as usize] = epoch;
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    pub fn active_ppn(&self, bank: u32, region: usize) -> Ppn {
        self.active_ppns[bank as usize][region]
    }

    pub fn active_ppns(&self) -> &[[Ppn; NUM_REGIONS]] {
        &self.active_ppns
    }

    /// Return the active cursor and advance it. Closing a block programs
    /// its summary page (reverse map plus the id of the next block, which
    /// recovery follows to chain blocks in arrival order) and stamps the
    /// new block's birth epoch.
    pub fn alloc_active_ppn<D: FlashDevice>(
        &mut self,
        bank: u32,
        region: usize,
        epoch: Epoch,
        blkmgr: &mut BlockManager,
        dev: &mut D,
    ) -> Result<Ppn> {
        let mut ppn = self.active_ppns[bank as usize][region];
        let ppb = self.geo.pages_per_block;

        if ppn % ppb == ppb - 1 {
            let closing_blk = ppn / ppb;
            let new_blk = blkmgr.allocate_active(bank, region)?;

            let base = self.lpn_slot_idx(bank, region, 0);
            let summary = SummaryPage {
                lpns: self.lpns[base..base + ppb as usize].to_vec(),
                next_block: new_blk,
            };
            let bps = self.geo.bytes_per_sector as usize;
            let len = SummaryPage::byte_len(ppb).div_ceil(bps) * bps;
            let mut buf = vec![0u8; len];
            summary.encode_into(&mut buf);

            wait_bank_idle(dev, bank)?;
            dev.page_program_partial(bank, closing_blk, ppb - 1, &buf, &PageTag::Erased)?;
            wait_bank_idle(dev, bank)?;

            self.lpns[base..base + ppb as usize].fill(0);
            self.set_blk_birth_epoch(bank, new_blk, epoch);
            ppn = new_blk * ppb;
            debug!(bank, region, closing_blk, new_blk, "data block closed");
        }

        if ppn / ppb >= self.geo.blocks_per_bank || ppn % ppb == ppb - 1 {
            return Err(FtlError::invariant(format!(
                "bank {bank} region {region}: active cursor {ppn} out of range"
            )));
        }
        self.active_ppns[bank as usize][region] = ppn + 1;
        Ok(ppn)
    }

    /// Return the log cursor and advance it. The last page of every log
    /// block is skipped so recovery can tell a full block from an empty one.
    pub fn alloc_log_ppn(&mut self, bank: u32, blkmgr: &mut BlockManager) -> Result<Ppn> {
        let mut ppn = self.log_ppns[bank as usize];
        let ppb = self.geo.pages_per_block;
        if ppn % ppb == ppb - 1 {
            ppn = blkmgr.allocate_log(bank)? * ppb;
        }
        self.log_ppns[bank as usize] = ppn + 1;
        Ok(ppn)
    }

    /// Point one bank's log cursor back at the first page of its log area.
    pub fn revert_log_cursor(&mut self, bank: u32, blkmgr: &mut BlockManager) -> Result<()> {
        blkmgr.revert_log(bank);
        let blk = blkmgr.allocate_log(bank)?;
        self.log_ppns[bank as usize] = blk * self.geo.pages_per_block;
        Ok(())
    }

    /// Park a bank's log cursor on a specific page. Recovery uses this to
    /// rest each cursor on the first erased log page it found.
    pub(crate) fn set_log_cursor(&mut self, bank: u32, ppn: Ppn) {
        self.log_ppns[bank as usize] = ppn;
    }

    // ------------------------------------------------------------------
    // Shadow snapshot
    // ------------------------------------------------------------------

    fn serialize_l2p(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.geo.map_table_bytes()];
        for (i, &ppn) in self.l2p.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&ppn.to_le_bytes());
        }
        bytes
    }

    fn deserialize_l2p(&mut self, bytes: &[u8]) {
        for (i, slot) in self.l2p.iter_mut().enumerate() {
            *slot = u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]);
        }
    }

    /// Persist the full L2P into the inactive shadow blocks, striping
    /// fixed-size pages round-robin across banks, then commit it with the
    /// magic page and toggle the shadow index. `epoch` is the dispatcher's
    /// current epoch; the snapshot records `epoch - 1` as committed.
    pub fn persist_map<D: FlashDevice>(
        &mut self,
        dev: &mut D,
        blkmgr: &mut BlockManager,
        epoch: Epoch,
    ) -> Result<()> {
        let banks = self.geo.banks;
        let bpp = self.geo.bytes_per_page();
        let bps = self.geo.bytes_per_sector as usize;

        // The target blocks are erased from the previous cycle, but a crash
        // between stripe and commit can leave them half written. Erasing
        // first makes persist safe to repeat.
        for bank in 0..banks {
            dev.block_erase(bank, blkmgr.map_blk(bank))?;
        }
        dev.flash_finish()?;

        let bytes = self.serialize_l2p();
        let mut bank = 0u32;
        let mut page = 0u32;
        for chunk in bytes.chunks(bpp) {
            let padded_len = chunk.len().div_ceil(bps) * bps;
            if padded_len == chunk.len() {
                dev.page_program_partial(bank, blkmgr.map_blk(bank), page, chunk, &PageTag::Erased)?;
            } else {
                let mut padded = vec![0u8; padded_len];
                padded[..chunk.len()].copy_from_slice(chunk);
                dev.page_program_partial(
                    bank,
                    blkmgr.map_blk(bank),
                    page,
                    &padded,
                    &PageTag::Erased,
                )?;
            }
            bank = (bank + 1) % banks;
            if bank == 0 {
                page += 1;
            }
        }

        let mut commit = vec![0u8; bps];
        encode_map_commit_page(epoch.wrapping_sub(1), &mut commit);
        dev.page_program_partial(
            0,
            blkmgr.map_blk(0),
            self.geo.map_commit_page(),
            &commit,
            &PageTag::Erased,
        )?;
        dev.flash_finish()?;

        // The block just written becomes current; the stale copy is erased
        // and will take the next snapshot.
        blkmgr.toggle_map_blk();
        for bank in 0..banks {
            dev.block_erase(bank, blkmgr.map_blk(bank))?;
        }
        dev.flash_finish()?;
        info!(epoch = epoch.wrapping_sub(1), "page map persisted");
        Ok(())
    }

    /// Restore the L2P from whichever shadow copy committed last. Returns
    /// the committed epoch, or `None` when neither copy is valid (fresh
    /// device). Leaves the shadow index naming the erased copy so the next
    /// persist cycle writes opposite the restored snapshot.
    pub fn restore_map<D: FlashDevice>(
        &mut self,
        dev: &mut D,
        blkmgr: &mut BlockManager,
    ) -> Result<Option<Epoch>> {
        let bps = self.geo.bytes_per_sector as usize;
        let commit_page = self.geo.map_commit_page();
        let pair = blkmgr.map_blk_pair(0);

        let mut epochs = [None, None];
        for (idx, &blk) in pair.iter().enumerate() {
            let mut buf = vec![0u8; bps];
            dev.page_read(0, blk, commit_page, 0, 1, &mut buf)?;
            epochs[idx] = decode_map_commit_page(&buf);
        }

        let chosen = match (epochs[0], epochs[1]) {
            (None, None) => {
                debug!("no page map snapshot found");
                return Ok(None);
            }
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (Some(a), Some(b)) => {
                if a > b {
                    0
                } else {
                    1
                }
            }
        };
        let epoch = epochs[chosen].unwrap_or(0);

        // Stripe-read the table back from the chosen copy.
        blkmgr.set_map_blk_idx(chosen);
        let banks = self.geo.banks;
        let bpp = self.geo.bytes_per_page();
        let mut bytes = vec![0u8; self.geo.map_table_bytes()];
        let mut bank = 0u32;
        let mut page = 0u32;
        let total = bytes.len();
        let mut off = 0usize;
        while off < total {
            let len = bpp.min(total - off);
            let n_sect = (len / bps) as u32;
            dev.page_read(
                bank,
                blkmgr.map_blk(bank),
                page,
                0,
                n_sect,
                &mut bytes[off..off + len],
            )?;
            off += len;
            bank = (bank + 1) % banks;
            if bank == 0 {
                page += 1;
            }
        }
        self.deserialize_l2p(&bytes);

        // Name the erased copy for the next persist cycle.
        blkmgr.set_map_blk_idx(1 - chosen);
        info!(epoch, "page map restored");
        Ok(Some(epoch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::SimFlash;
    use crate::geometry::REGION_COLD;
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

    fn setup() -> (PageMap, BlockManager, SimFlash) {
        let c = cfg();
        let geo = c.geometry();
        let mut blkmgr = BlockManager::new(&c).unwrap();
        let mut pgmap = PageMap::new(geo);
        pgmap.init_cursors(&mut blkmgr).unwrap();
        (pgmap, blkmgr, SimFlash::new(geo))
    }

    #[test]
    fn test_active_cursor_skips_summary_page() {
        let (mut pgmap, mut blkmgr, mut dev) = setup();
        let mut seen = Vec::new();
        // Allocating one past a full block closes it and writes a summary.
        for _ in 0..8 {
            let ppn = pgmap
                .alloc_active_ppn(0, REGION_COLD, 1, &mut blkmgr, &mut dev)
                .unwrap();
            assert_ne!(ppn % 8, 7, "summary page must never be handed out");
            seen.push(ppn);
        }
        // Pages 0..7 of the first block, then page 0 of the next.
        let first_blk = seen[0] / 8;
        assert_eq!(seen[6] / 8, first_blk);
        assert_ne!(seen[7] / 8, first_blk);
        assert!(dev.is_programmed(0, first_blk, 7));

        // The summary chains to the new block.
        let mut buf = vec![0u8; 64];
        dev.page_read(0, first_blk, 7, 0, 1, &mut buf).unwrap();
        let summary = SummaryPage::decode(&buf, 8);
        assert_eq!(summary.next_block, seen[7] / 8);
    }

    #[test]
    fn test_reverse_map_lands_in_summary() {
        let (mut pgmap, mut blkmgr, mut dev) = setup();
        for i in 0..8u32 {
            let ppn = pgmap
                .alloc_active_ppn(0, REGION_COLD, 1, &mut blkmgr, &mut dev)
                .unwrap();
            if i < 7 {
                pgmap.set_lpn_slot(0, REGION_COLD, ppn % 8, 100 + i);
            }
        }
        // The 8th allocation closed the first block; its summary carries
        // the recorded lpns, and the in-memory slots were cleared for the
        // freshly opened block.
        let closed = (0..32).find(|&b| dev.is_programmed(0, b, 7)).unwrap();
        let mut buf = vec![0u8; 64];
        dev.page_read(0, closed, 7, 0, 1, &mut buf).unwrap();
        let summary = SummaryPage::decode(&buf, 8);
        assert_eq!(&summary.lpns[0..7], &[100, 101, 102, 103, 104, 105, 106]);
        assert_eq!(pgmap.lpn_slot(0, REGION_COLD, 0), 0);
    }

    #[test]
    fn test_log_cursor_skips_block_tail() {
        let (mut pgmap, mut blkmgr, _dev) = setup();
        let mut last_blk = None;
        for _ in 0..14 {
            let ppn = pgmap.alloc_log_ppn(0, &mut blkmgr).unwrap();
            assert_ne!(ppn % 8, 7);
            last_blk = Some(ppn / 8);
        }
        // 7 usable pages per log block: 14 allocations span both blocks.
        assert_ne!(Some(blkmgr.log_first_blk(0)), last_blk);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (mut pgmap, mut blkmgr, mut dev) = setup();
        pgmap.set_ppn(3, 77);
        pgmap.set_ppn(127, 901);
        pgmap.persist_map(&mut dev, &mut blkmgr, 10).unwrap();

        let c = cfg();
        let mut blkmgr2 = BlockManager::new(&c).unwrap();
        let mut fresh = PageMap::new(c.geometry());
        let restored = fresh.restore_map(&mut dev, &mut blkmgr2).unwrap();
        assert_eq!(restored, Some(9));
        assert_eq!(fresh.ppn(3), 77);
        assert_eq!(fresh.ppn(127), 901);
        assert_eq!(fresh.ppn(5), 0);
    }

    #[test]
    fn test_snapshot_alternates_and_keeps_newest() {
        let (mut pgmap, mut blkmgr, mut dev) = setup();
        pgmap.set_ppn(1, 11);
        pgmap.persist_map(&mut dev, &mut blkmgr, 5).unwrap();
        pgmap.set_ppn(1, 22);
        pgmap.persist_map(&mut dev, &mut blkmgr, 9).unwrap();

        let c = cfg();
        let mut blkmgr2 = BlockManager::new(&c).unwrap();
        let mut fresh = PageMap::new(c.geometry());
        assert_eq!(fresh.restore_map(&mut dev, &mut blkmgr2).unwrap(), Some(8));
        assert_eq!(fresh.ppn(1), 22);
    }

    #[test]
    fn test_restore_fresh_device() {
        let (mut pgmap, mut blkmgr, mut dev) = setup();
        assert_eq!(pgmap.restore_map(&mut dev, &mut blkmgr).unwrap(), None);
    }

    #[test]
    fn test_trim_clears_mappings() {
        let (mut pgmap, _blkmgr, _dev) = setup();
        pgmap.set_ppn(10, 5);
        pgmap.set_ppn(11, 6);
        pgmap.set_ppn(12, 7);
        pgmap.trim(10, 2);
        assert_eq!(pgmap.ppn(10), 0);
        assert_eq!(pgmap.ppn(11), 0);
        assert_eq!(pgmap.ppn(12), 7);
    }
}
