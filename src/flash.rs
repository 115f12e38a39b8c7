// NAND device boundary.
//
// The FTL core consumes the `FlashDevice` trait and never touches raw media
// itself. Banks operate independently: program, copyback, and erase are
// asynchronous per bank, and completion is observed by polling `bank_idle`.
// Issuing a command on a busy bank is legal at this interface; the device
// serializes it behind the in-flight command, like the flash controller's
// issue queue does in hardware.
//
// `SimFlash` is the in-memory reference device used by the test suite. It
// keeps per-page data plus the 12-byte spare, rejects programs to unerased
// pages, and models completion latency with a per-bank countdown that
// idle polls drain. Cloning a `SimFlash` shares the backing media, which is
// how tests simulate a power cut: drop the FTL, reopen over the clone.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{FtlError, Result};
use crate::geometry::Geometry;
use crate::layout::{PageTag, SPARE_BYTES};

pub trait FlashDevice {
    /// Read `n_sect` sectors starting at `sect` into `out`. Data is valid on
    /// return; `out` must hold exactly `n_sect` sectors.
    fn page_read(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        sect: u32,
        n_sect: u32,
        out: &mut [u8],
    ) -> Result<()>;

    /// Read a page's spare-area tag without transferring data.
    fn read_spare(&mut self, bank: u32, blk: u32, page: u32) -> Result<PageTag>;

    /// Program a full page. Asynchronous: the bank goes busy.
    fn page_program(&mut self, bank: u32, blk: u32, page: u32, data: &[u8], tag: &PageTag)
        -> Result<()>;

    /// Program the leading sectors of a page (summary, log, and map pages
    /// are allowed to be partial). `data` must be sector-aligned in length.
    fn page_program_partial(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        data: &[u8],
        tag: &PageTag,
    ) -> Result<()>;

    /// Copy a page within one bank, replacing the spare tag.
    fn page_copyback(
        &mut self,
        bank: u32,
        src_blk: u32,
        src_page: u32,
        dst_blk: u32,
        dst_page: u32,
        tag: &PageTag,
    ) -> Result<()>;

    fn block_erase(&mut self, bank: u32, blk: u32) -> Result<()>;

    /// Poll a bank's state machine. Polling is what drives simulated
    /// completion, so callers must not cache the result.
    fn bank_idle(&mut self, bank: u32) -> bool;

    /// Quiesce: wait for every bank to go idle.
    fn flash_finish(&mut self) -> Result<()>;
}

/// Bounded blocking wait on one bank. Used where a program must settle
/// before proceeding (block summaries, map snapshots).
pub fn wait_bank_idle<D: FlashDevice + ?Sized>(dev: &mut D, bank: u32) -> Result<()> {
    const MAX_POLLS: u32 = 1 << 20;
    for _ in 0..MAX_POLLS {
        if dev.bank_idle(bank) {
            return Ok(());
        }
    }
    Err(FtlError::DeviceTimeout(bank))
}

// ============================================================================
// SimFlash
// ============================================================================

#[derive(Clone)]
struct PageState {
    data: Vec<u8>,
    spare: [u8; SPARE_BYTES],
}

struct FlashState {
    geo: Geometry,
    /// Programmed pages, keyed by (bank, blk, page). Absent means erased.
    pages: HashMap<(u32, u32, u32), PageState>,
    /// Remaining completion polls per bank.
    busy: Vec<u32>,
    program_ops: u64,
    erase_ops: u64,
    read_ops: u64,
}

impl FlashState {
    fn check_addr(&self, bank: u32, blk: u32, page: u32) -> Result<()> {
        if bank >= self.geo.banks
            || blk >= self.geo.blocks_per_bank
            || page >= self.geo.pages_per_block
        {
            return Err(FtlError::Device(format!(
                "address out of range: bank {bank}, block {blk}, page {page}"
            )));
        }
        Ok(())
    }

    fn program(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        data: Vec<u8>,
        spare: [u8; SPARE_BYTES],
    ) -> Result<()> {
        self.check_addr(bank, blk, page)?;
        let key = (bank, blk, page);
        if self.pages.contains_key(&key) {
            return Err(FtlError::Device(format!(
                "program to unerased page: bank {bank}, block {blk}, page {page}"
            )));
        }
        self.pages.insert(key, PageState { data, spare });
        self.program_ops += 1;
        self.busy[bank as usize] = SimFlash::PROGRAM_LATENCY;
        Ok(())
    }
}

/// In-memory NAND with shared backing media.
#[derive(Clone)]
pub struct SimFlash {
    state: Arc<Mutex<FlashState>>,
}

impl SimFlash {
    /// Number of idle polls a bank stays busy after an asynchronous operation.
    const PROGRAM_LATENCY: u32 = 2;

    pub fn new(geo: Geometry) -> SimFlash {
        SimFlash {
            state: Arc::new(Mutex::new(FlashState {
                geo,
                pages: HashMap::new(),
                busy: vec![0; geo.banks as usize],
                program_ops: 0,
                erase_ops: 0,
                read_ops: 0,
            })),
        }
    }

    /// Number of program operations issued so far (test observability).
    pub fn program_ops(&self) -> u64 {
        self.state.lock().program_ops
    }

    pub fn erase_ops(&self) -> u64 {
        self.state.lock().erase_ops
    }

    /// Whether a page has been programmed since its last erase.
    pub fn is_programmed(&self, bank: u32, blk: u32, page: u32) -> bool {
        self.state.lock().pages.contains_key(&(bank, blk, page))
    }
}

impl FlashDevice for SimFlash {
    fn page_read(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        sect: u32,
        n_sect: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let mut st = self.state.lock();
        st.check_addr(bank, blk, page)?;
        let bps = st.geo.bytes_per_sector as usize;
        let want = n_sect as usize * bps;
        if out.len() != want {
            return Err(FtlError::Device(format!(
                "read buffer is {} bytes, expected {}",
                out.len(),
                want
            )));
        }
        if sect + n_sect > st.geo.sectors_per_page {
            return Err(FtlError::Device(format!(
                "sector range {}..{} exceeds page",
                sect,
                sect + n_sect
            )));
        }
        st.read_ops += 1;
        match st.pages.get(&(bank, blk, page)) {
            Some(p) => {
                let start = sect as usize * bps;
                out.copy_from_slice(&p.data[start..start + want]);
            }
            None => out.fill(0xFF),
        }
        Ok(())
    }

    fn read_spare(&mut self, bank: u32, blk: u32, page: u32) -> Result<PageTag> {
        let st = self.state.lock();
        st.check_addr(bank, blk, page)?;
        match st.pages.get(&(bank, blk, page)) {
            Some(p) => Ok(PageTag::decode(&p.spare)),
            None => Ok(PageTag::Erased),
        }
    }

    fn page_program(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        data: &[u8],
        tag: &PageTag,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let bpp = st.geo.bytes_per_page();
        if data.len() != bpp {
            return Err(FtlError::Device(format!(
                "full-page program with {} bytes, page is {}",
                data.len(),
                bpp
            )));
        }
        st.program(bank, blk, page, data.to_vec(), tag.encode())
    }

    fn page_program_partial(
        &mut self,
        bank: u32,
        blk: u32,
        page: u32,
        data: &[u8],
        tag: &PageTag,
    ) -> Result<()> {
        let mut st = self.state.lock();
        let bpp = st.geo.bytes_per_page();
        let bps = st.geo.bytes_per_sector as usize;
        if data.len() > bpp || data.len() % bps != 0 {
            return Err(FtlError::Device(format!(
                "partial program with {} bytes is not sector-aligned",
                data.len()
            )));
        }
        // Unwritten remainder reads back as erased flash.
        let mut full = vec![0xFFu8; bpp];
        full[..data.len()].copy_from_slice(data);
        st.program(bank, blk, page, full, tag.encode())
    }

    fn page_copyback(
        &mut self,
        bank: u32,
        src_blk: u32,
        src_page: u32,
        dst_blk: u32,
        dst_page: u32,
        tag: &PageTag,
    ) -> Result<()> {
        let mut st = self.state.lock();
        st.check_addr(bank, src_blk, src_page)?;
        let data = match st.pages.get(&(bank, src_blk, src_page)) {
            Some(p) => p.data.clone(),
            None => vec![0xFFu8; st.geo.bytes_per_page()],
        };
        st.program(bank, dst_blk, dst_page, data, tag.encode())
    }

    fn block_erase(&mut self, bank: u32, blk: u32) -> Result<()> {
        let mut st = self.state.lock();
        st.check_addr(bank, blk, 0)?;
        for page in 0..st.geo.pages_per_block {
            st.pages.remove(&(bank, blk, page));
        }
        st.erase_ops += 1;
        st.busy[bank as usize] = SimFlash::PROGRAM_LATENCY;
        debug!(bank, blk, "block erased");
        Ok(())
    }

    fn bank_idle(&mut self, bank: u32) -> bool {
        let mut st = self.state.lock();
        let b = &mut st.busy[bank as usize];
        if *b > 0 {
            *b -= 1;
            false
        } else {
            true
        }
    }

    fn flash_finish(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.busy.fill(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry {
            banks: 2,
            blocks_per_bank: 8,
            pages_per_block: 4,
            sectors_per_page: 2,
            bytes_per_sector: 32,
            logical_pages: 16,
        }
    }

    #[test]
    fn test_erased_page_reads_ones() {
        let mut dev = SimFlash::new(geo());
        let mut buf = vec![0u8; 64];
        dev.page_read(0, 1, 0, 0, 2, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
        assert_eq!(dev.read_spare(0, 1, 0).unwrap(), PageTag::Erased);
    }

    #[test]
    fn test_program_then_read_back() {
        let mut dev = SimFlash::new(geo());
        let data = vec![0xABu8; 64];
        let tag = PageTag::HostWrite {
            lpn: 5,
            pg_span: 1,
            epoch: 2,
        };
        dev.page_program(1, 2, 3, &data, &tag).unwrap();
        let mut buf = vec![0u8; 32];
        dev.page_read(1, 2, 3, 1, 1, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAB));
        assert_eq!(dev.read_spare(1, 2, 3).unwrap(), tag);
    }

    #[test]
    fn test_program_unerased_rejected() {
        let mut dev = SimFlash::new(geo());
        let data = vec![0u8; 64];
        dev.page_program(0, 1, 0, &data, &PageTag::Erased).unwrap();
        assert!(dev.page_program(0, 1, 0, &data, &PageTag::Erased).is_err());
        dev.block_erase(0, 1).unwrap();
        dev.page_program(0, 1, 0, &data, &PageTag::Erased).unwrap();
    }

    #[test]
    fn test_busy_drains_with_polls() {
        let mut dev = SimFlash::new(geo());
        let data = vec![0u8; 64];
        dev.page_program(0, 1, 0, &data, &PageTag::Erased).unwrap();
        assert!(!dev.bank_idle(0));
        // The other bank is unaffected.
        assert!(dev.bank_idle(1));
        wait_bank_idle(&mut dev, 0).unwrap();
        assert!(dev.bank_idle(0));
    }

    #[test]
    fn test_copyback_carries_data_and_retags() {
        let mut dev = SimFlash::new(geo());
        let data = vec![0x5Au8; 64];
        let src_tag = PageTag::HostWrite {
            lpn: 9,
            pg_span: 1,
            epoch: 4,
        };
        dev.page_program(0, 2, 1, &data, &src_tag).unwrap();
        dev.page_copyback(0, 2, 1, 3, 0, &PageTag::GcSurvivor { lpn: 9 })
            .unwrap();
        let mut buf = vec![0u8; 64];
        dev.page_read(0, 3, 0, 0, 2, &mut buf).unwrap();
        assert_eq!(buf, data);
        assert_eq!(
            dev.read_spare(0, 3, 0).unwrap(),
            PageTag::GcSurvivor { lpn: 9 }
        );
    }

    #[test]
    fn test_shared_media_survives_clone() {
        let dev = SimFlash::new(geo());
        let mut a = dev.clone();
        let data = vec![0x11u8; 64];
        a.page_program(0, 4, 0, &data, &PageTag::Erased).unwrap();
        drop(a);
        let mut b = dev;
        let mut buf = vec![0u8; 64];
        b.page_read(0, 4, 0, 0, 2, &mut buf).unwrap();
        assert_eq!(buf, data);
    }
}
