//! Memory-mapped xSPI NOR flash behind the [`IoDevice`] interface.
//!
//! The array reads like memory but programs only in fixed, aligned
//! pages, so writes that start or end mid-page go through a
//! read-modify-write of the touched edge pages; full pages in between
//! are programmed straight from the caller's buffer.

use log::warn;
use static_assertions::const_assert;

use crate::err::SdError;

use super::{BlockSpec, IoDevice, SeekMode};

/// Page-program granularity of the device.
pub const WRITE_PROG_SIZE: usize = 256;
const_assert!(WRITE_PROG_SIZE.is_power_of_two());

/// The mapped flash device itself, supplied by the board layer.
pub trait XspiFlash {
    /// One-time controller bring-up, run when the device opens.
    fn setup(&mut self);
    /// Copy out of the mapped array.
    fn read(&self, offset: u64, buf: &mut [u8]);
    /// Program one page-aligned range.
    fn program(&mut self, offset: u64, data: &[u8]) -> Result<(), SdError>;
    /// Make the mapped window coherent over the just-programmed range.
    fn flush_cache(&mut self, offset: u64, len: usize);
}

/// State of the single open file. `in_use` is the gate; any value of the
/// other fields could be legitimate.
#[derive(Debug, Default, Clone, Copy)]
struct FileState {
    in_use: bool,
    base: u64,
    file_pos: u64,
    size: u64,
}

/// Token for the open region. Not copyable; closing consumes it.
#[derive(Debug)]
pub struct XspiEntity {
    _open: (),
}

/// The xSPI IO device. Only one file can be open at a time: with no
/// allocator, the file state lives in a single static-sized slot that is
/// wiped on close for the next open.
pub struct XspiIoDev<F: XspiFlash> {
    flash: F,
    file: FileState,
    page_buf: [u8; WRITE_PROG_SIZE],
}

impl<F: XspiFlash> XspiIoDev<F> {
    /// Open the device connection and bring up the controller.
    pub fn new(mut flash: F) -> Self {
        flash.setup();
        XspiIoDev {
            flash,
            file: FileState::default(),
            page_buf: [0; WRITE_PROG_SIZE],
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

fn round_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

impl<F: XspiFlash> IoDevice for XspiIoDev<F> {
    type Entity = XspiEntity;

    fn open(&mut self, spec: &BlockSpec) -> Result<XspiEntity, SdError> {
        if self.file.in_use {
            warn!("an xspi region is already open, close it first");
            return Err(SdError::DeviceBusy);
        }
        self.file = FileState {
            in_use: true,
            base: spec.offset,
            // cursor for seek and incremental reads
            file_pos: 0,
            size: spec.length,
        };
        Ok(XspiEntity { _open: () })
    }

    fn seek(
        &mut self,
        _entity: &mut XspiEntity,
        mode: SeekMode,
        offset: i64,
    ) -> Result<(), SdError> {
        match mode {
            SeekMode::Set => {
                assert!(offset >= 0 && (offset as u64) < self.file.size);
                self.file.file_pos = offset as u64;
                Ok(())
            }
        }
    }

    fn len(&self, _entity: &XspiEntity) -> Result<u64, SdError> {
        Ok(self.file.size)
    }

    fn read(&mut self, _entity: &mut XspiEntity, buf: &mut [u8]) -> Result<usize, SdError> {
        let pos_after = self.file.file_pos + buf.len() as u64;
        assert!(pos_after >= self.file.file_pos && pos_after <= self.file.size);

        self.flash.read(self.file.base + self.file.file_pos, buf);
        self.file.file_pos = pos_after;
        Ok(buf.len())
    }

    fn write(&mut self, _entity: &mut XspiEntity, buf: &[u8]) -> Result<usize, SdError> {
        let length = buf.len() as u64;
        let pos_after = self.file.file_pos + length;
        assert!(pos_after >= self.file.file_pos && pos_after <= self.file.size);

        if length > 0 {
            let page = WRITE_PROG_SIZE as u64;
            let base = self.file.base;
            let pos = self.file.file_pos;

            let mut first_page = round_down(pos, page);
            let first_offset = (pos % page) as usize;
            let last_page = round_down(pos + length - 1, page);
            let last_offset = ((pos + length) % page) as usize;

            let mut buffer_offset = 0usize;
            let mut page_count = (last_page - first_page) / page + 1;

            if first_offset > 0 {
                self.flash.read(base + first_page, &mut self.page_buf);

                buffer_offset = (page - (pos - first_page)) as usize;
                buffer_offset = buffer_offset.min(buf.len());
                self.page_buf[first_offset..first_offset + buffer_offset]
                    .copy_from_slice(&buf[..buffer_offset]);

                if self.flash.program(base + first_page, &self.page_buf).is_err() {
                    return Err(SdError::Io);
                }
                self.flash.flush_cache(base + first_page, WRITE_PROG_SIZE);

                first_page += page;
                page_count -= 1;
            }

            if page_count > 0 && last_offset > 0 {
                self.flash.read(base + last_page, &mut self.page_buf);
                self.page_buf[..last_offset].copy_from_slice(&buf[buf.len() - last_offset..]);

                if self.flash.program(base + last_page, &self.page_buf).is_err() {
                    return Err(SdError::Io);
                }
                self.flash.flush_cache(base + last_page, WRITE_PROG_SIZE);

                page_count -= 1;
            }

            if page_count > 0 {
                let mid = page_count as usize * WRITE_PROG_SIZE;
                if self
                    .flash
                    .program(base + first_page, &buf[buffer_offset..buffer_offset + mid])
                    .is_err()
                {
                    return Err(SdError::Io);
                }
                self.flash.flush_cache(base + first_page, mid);
            }
        }

        self.file.file_pos = pos_after;
        Ok(buf.len())
    }

    fn close(&mut self, entity: XspiEntity) -> Result<(), SdError> {
        let _ = entity;
        // the slot is reused by the next open, wipe it
        self.file = FileState::default();
        Ok(())
    }
}
