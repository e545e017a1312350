//! SD/MMC card driver: presence monitoring, bring-up negotiation, mount
//! sequencing and the byte/block transfer engine.

mod cd;
mod cmd;
mod mount;
mod trns;

pub mod constant;
pub mod dev;

pub use cd::CdCallback;
pub use dev::{BusWidth, CdLayout, SdDev};
pub use trns::LockOp;

use bitflags::bitflags;

use crate::err::SdError;
use constant::SECTOR_SIZE;

/// Number of SDHI channels.
pub const NUM_PORT: usize = 2;

bitflags! {
    /// Card class established during initialization. A combo card carries
    /// both the SD memory and the IO function.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MediaType: u16 {
        const MMC = 0x0010;
        const SD = 0x0020;
        const IO = 0x0040;
        /// Any card with a memory part.
        const MEM = 0x0030;
        /// Cards that negotiate their own relative address.
        const COMBO = 0x0060;
    }
}

bitflags! {
    /// Driver operating mode, chosen by the caller at mount time. The
    /// absence of a bit selects the default: polling completion, CPU
    /// data transfer, memory-only media, version 1.x host signalling.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SdMode: u32 {
        /// Hardware-interrupt completion instead of polling.
        const HWINT = 0x0001;
        /// DMA data phase instead of the CPU buffer port.
        const DMA = 0x0002;
        /// Accept IO cards.
        const IO = 0x0010;
        /// Accept memory, IO and combo cards.
        const COMBO = 0x0030;
        /// Version 2.x host signalling (CMD8 interface probe).
        const VER2X = 0x0080;
    }
}

bitflags! {
    /// Accumulated write-protection sources.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteProtect: u8 {
        /// CSD permanent/temporary protect bits.
        const HARD = 0x01;
        const TEMP = 0x02;
        const PERM = 0x04;
        /// ROM card reported through SD_STATUS.
        const ROM = 0x10;
    }
}

/// Mount progress of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    /// The card answered CMD7 but is password-locked. The clock is halted;
    /// unlock it through [`Sdhi::lock_unlock`] and mount again.
    LockedCard,
    UnlockedCard,
}

/// Negotiated physical-layer specification version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SdSpec {
    V1_0,
    V1_1,
    V2_0,
    V3_0,
}

pub(crate) fn port_index(port: u32) -> Result<usize, SdError> {
    if (port as usize) < NUM_PORT {
        Ok(port as usize)
    } else {
        Err(SdError::Failed)
    }
}

/// Per-port card session. Identity and negotiated card registers are set
/// during mount and read-only afterwards.
#[derive(Debug)]
pub struct SdHandle {
    pub(crate) port: u32,
    pub(crate) media_type: MediaType,
    pub(crate) mount: MountState,
    pub(crate) sd_spec: SdSpec,
    pub(crate) rca: u16,
    pub(crate) cid: [u16; 8],
    pub(crate) csd: [u16; 8],
    pub(crate) scr: [u16; 4],
    pub(crate) sd_status: [u16; 8],
    pub(crate) dsr: u16,
    pub(crate) ocr: u32,
    pub(crate) if_cond: [u16; 2],
    pub(crate) resp_status: u32,
    pub(crate) partition_id: Option<u8>,
    pub(crate) mode: SdMode,
    pub(crate) voltage: u32,
    pub(crate) csd_tran_speed: u32,
    pub(crate) card_sectors: u64,
    pub(crate) prot_sectors: u64,
    pub(crate) erase_sectors: u32,
    pub(crate) speed_class: u8,
    pub(crate) perform_move: u8,
    pub(crate) write_protect: WriteProtect,
    pub(crate) error: Option<SdError>,
    pub(crate) if_mode: BusWidth,
    pub(crate) sup_if_mode: BusWidth,
    pub(crate) block_addressing: bool,
    pub(crate) int_info1_mask: u64,
    pub(crate) int_info2_mask: u64,
    pub(crate) cd_callback: Option<CdCallback>,
}

impl SdHandle {
    pub(crate) fn new(port: u32) -> Self {
        let mut h = SdHandle {
            port,
            media_type: MediaType::empty(),
            mount: MountState::Unmounted,
            sd_spec: SdSpec::V1_0,
            rca: 0,
            cid: [0; 8],
            csd: [0; 8],
            scr: [0; 4],
            sd_status: [0; 8],
            dsr: 0,
            ocr: 0,
            if_cond: [0; 2],
            resp_status: 0,
            partition_id: None,
            mode: SdMode::empty(),
            voltage: 0,
            csd_tran_speed: 0,
            card_sectors: 0,
            prot_sectors: 0,
            erase_sectors: 0,
            speed_class: 0,
            perform_move: 0,
            write_protect: WriteProtect::empty(),
            error: None,
            if_mode: BusWidth::Single,
            sup_if_mode: BusWidth::Quad,
            block_addressing: false,
            int_info1_mask: 0,
            int_info2_mask: 0,
            cd_callback: None,
        };
        h.init(SdMode::empty(), 0);
        h
    }

    /// Reset the negotiation state for a fresh mount attempt. The detect
    /// callback registration survives; it has its own lifecycle.
    pub(crate) fn init(&mut self, mode: SdMode, voltage: u32) {
        self.media_type = MediaType::empty();
        self.mount = MountState::Unmounted;
        self.sd_spec = SdSpec::V1_0;
        self.rca = 0;
        self.cid = [0; 8];
        self.csd = [0; 8];
        self.scr = [0; 4];
        self.sd_status = [0; 8];
        self.dsr = 0;
        self.ocr = 0;
        // CMD8 argument: 2.7-3.6V signalling with the 0xAA check pattern
        self.if_cond = [0x0000, 0x01aa];
        self.resp_status = 0;
        self.partition_id = None;
        self.mode = mode;
        self.voltage = voltage;
        self.csd_tran_speed = 0;
        self.card_sectors = 0;
        self.prot_sectors = 0;
        self.erase_sectors = 0;
        self.speed_class = 0;
        self.perform_move = 0;
        self.write_protect = WriteProtect::empty();
        self.error = None;
        self.if_mode = BusWidth::Single;
        self.sup_if_mode = BusWidth::Quad;
        self.block_addressing = false;
        self.int_info1_mask = 0;
        self.int_info2_mask = 0;
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn mount_state(&self) -> MountState {
        self.mount
    }

    pub fn sd_spec(&self) -> SdSpec {
        self.sd_spec
    }

    pub fn rca(&self) -> u16 {
        self.rca
    }

    pub fn cid(&self) -> [u16; 8] {
        self.cid
    }

    pub fn csd(&self) -> [u16; 8] {
        self.csd
    }

    pub fn scr(&self) -> [u16; 4] {
        self.scr
    }

    pub fn dsr(&self) -> u16 {
        self.dsr
    }

    pub fn ocr(&self) -> u32 {
        self.ocr
    }

    /// Currently selected enhanced-SD physical partition, when the card
    /// implements the extension.
    pub fn partition_id(&self) -> Option<u8> {
        self.partition_id
    }

    /// Usable user-area size, in 512-byte sectors.
    pub fn sectors(&self) -> u64 {
        self.card_sectors
    }

    /// Erase geometry, in sectors; zero until an SD 2.0 card is mounted.
    pub fn erase_sectors(&self) -> u32 {
        self.erase_sectors
    }

    pub fn speed_class(&self) -> u8 {
        self.speed_class
    }

    pub fn perform_move(&self) -> u8 {
        self.perform_move
    }

    /// Protected-area size, in sectors (SD memory cards only).
    pub fn protected_sectors(&self) -> u64 {
        self.prot_sectors
    }

    /// Bus width currently programmed for the port.
    pub fn bus_width(&self) -> BusWidth {
        self.if_mode
    }

    /// Interrupt sources the driver currently has unmasked, as
    /// `(SD_INFO1, SD_INFO2)` bits. Interrupt glue can use this to decide
    /// which events to forward.
    pub fn enabled_int_masks(&self) -> (u64, u64) {
        (self.int_info1_mask, self.int_info2_mask)
    }

    pub fn write_protect(&self) -> WriteProtect {
        self.write_protect
    }

    /// Most recent error on this port. Agrees with the value returned by
    /// the failing operation; cleared when a new operation starts.
    pub fn last_error(&self) -> Option<SdError> {
        self.error
    }
}

/// The SDHI driver context: the injected hardware shim plus one session
/// slot per port. Exactly one operation runs at a time (`&mut self`), and
/// each port's work buffer is attached by the caller because this
/// environment cannot allocate.
pub struct Sdhi<'b, D: SdDev> {
    dev: D,
    handles: [Option<SdHandle>; NUM_PORT],
    bufs: [Option<&'b mut [u8]>; NUM_PORT],
}

impl<'b, D: SdDev> Sdhi<'b, D> {
    pub fn new(dev: D) -> Self {
        Sdhi {
            dev,
            handles: [None, None],
            bufs: [None, None],
        }
    }

    /// Create the session slot for a port. Fails on an out-of-range port
    /// or a port that is already initialized.
    pub fn init_port(&mut self, port: u32) -> Result<(), SdError> {
        let idx = port_index(port)?;
        if self.handles[idx].is_some() {
            return Err(SdError::Failed);
        }
        self.handles[idx] = Some(SdHandle::new(port));
        Ok(())
    }

    /// Attach the caller-owned work buffer a mount needs for register
    /// reads. At least one sector long.
    pub fn set_buffer(&mut self, port: u32, buf: &'b mut [u8]) -> Result<(), SdError> {
        let idx = port_index(port)?;
        if self.handles[idx].is_none() || buf.len() < SECTOR_SIZE {
            return Err(SdError::Failed);
        }
        self.bufs[idx] = Some(buf);
        Ok(())
    }

    /// Session state of a port, if initialized.
    pub fn session(&self, port: u32) -> Result<&SdHandle, SdError> {
        let idx = port_index(port)?;
        self.handles[idx].as_ref().ok_or(SdError::Failed)
    }

    pub fn dev(&self) -> &D {
        &self.dev
    }

    pub fn dev_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    pub(crate) fn parts(&mut self, port: u32) -> Result<(&mut D, &mut SdHandle), SdError> {
        let idx = port_index(port)?;
        let h = self.handles[idx].as_mut().ok_or(SdError::Failed)?;
        Ok((&mut self.dev, h))
    }

    pub(crate) fn parts_buf(
        &mut self,
        port: u32,
    ) -> Result<(&mut D, &mut SdHandle, &mut [u8]), SdError> {
        let idx = port_index(port)?;
        let h = self.handles[idx].as_mut().ok_or(SdError::Failed)?;
        let buf = self.bufs[idx].as_deref_mut().ok_or(SdError::Failed)?;
        Ok((&mut self.dev, h, buf))
    }
}
