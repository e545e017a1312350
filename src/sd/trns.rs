use log::debug;

use crate::err::SdError;

use super::{
    MediaType, MountState, SdHandle, SdMode, Sdhi,
    cmd::{
        RespKind, check_info2_err, clear_int_mask, get_resp, send_cmd, send_cmd_arg, set_err,
        set_int_mask, split_arg,
    },
    constant::*,
    dev::SdDev,
    mount::write_byte,
};

/// Data phase direction with its buffer.
pub(crate) enum Transfer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

/// Card lock operations carried by CMD42.
#[derive(Debug, Clone, Copy)]
pub enum LockOp<'a> {
    /// Erase the card together with a forgotten password. Writes a single
    /// control byte and runs on the extended erase timeout.
    ForceErase,
    /// Set or replace the password.
    SetPassword(&'a [u8]),
    /// Clear the password.
    ClearPassword(&'a [u8]),
    /// Lock the card with the current password.
    Lock(&'a [u8]),
    /// Unlock the card with the current password.
    Unlock(&'a [u8]),
}

impl<'b, D: SdDev> Sdhi<'b, D> {
    /// Read `cnt` sectors starting at physical sector `psn` into `buf`.
    pub fn read_sect(
        &mut self,
        port: u32,
        buf: &mut [u8],
        psn: u64,
        cnt: u32,
    ) -> Result<(), SdError> {
        let (dev, h) = self.parts(port)?;
        sect_trans(dev, h, Transfer::Read(buf), psn, cnt)
    }

    /// Write `cnt` sectors starting at physical sector `psn` from `buf`.
    pub fn write_sect(
        &mut self,
        port: u32,
        buf: &[u8],
        psn: u64,
        cnt: u32,
    ) -> Result<(), SdError> {
        let (dev, h) = self.parts(port)?;
        sect_trans(dev, h, Transfer::Write(buf), psn, cnt)
    }

    /// Run a CMD42 lock operation against the mounted (or locked) card.
    pub fn lock_unlock(&mut self, port: u32, op: LockOp<'_>) -> Result<(), SdError> {
        let (dev, h) = self.parts(port)?;
        lock_unlock_inner(dev, h, op)
    }
}

/// One sector-granular data command: CMD17/18 for reads, CMD24/25 for
/// writes, with the data phase run by software or DMA per the mount mode.
fn sect_trans<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    xfer: Transfer<'_>,
    psn: u64,
    cnt: u32,
) -> Result<(), SdError> {
    h.error = None;
    if h.mount != MountState::UnlockedCard || !h.media_type.intersects(MediaType::MEM) {
        return Err(set_err(h, SdError::Failed));
    }
    if cnt == 0 {
        return Ok(());
    }
    let writing = matches!(&xfer, Transfer::Write(_));
    let buf_len = match &xfer {
        Transfer::Read(b) => b.len(),
        Transfer::Write(b) => b.len(),
    };
    if buf_len < cnt as usize * SECTOR_SIZE {
        return Err(set_err(h, SdError::Failed));
    }
    if psn + cnt as u64 > h.card_sectors {
        return Err(set_err(h, SdError::OutOfRange));
    }
    if writing && !h.write_protect.is_empty() {
        return Err(set_err(h, SdError::WriteProtected));
    }

    dev.set_sector_count(h.port, if cnt > 1 { Some(cnt) } else { None });
    dev.set_transfer_bytes(h.port, SECTOR_SIZE as u32);

    let dma = h.mode.contains(SdMode::DMA);
    if dma && dev.enable_dma(h.port).is_err() {
        return Err(set_err(h, SdError::CpuInterface));
    }

    let addr = if h.block_addressing {
        psn
    } else {
        psn * SECTOR_SIZE as u64
    };
    let (hi, lo) = split_arg(addr as u32);
    let cmd = match (writing, cnt > 1) {
        (false, false) => CMD17,
        (false, true) => CMD18,
        (true, false) => CMD24,
        (true, true) => CMD25,
    };
    debug!("port{}: CMD{} psn {} cnt {}", h.port, cmd, psn, cnt);

    if send_cmd(dev, h, cmd, hi, lo).is_err() || get_resp(dev, h, RespKind::R1).is_err() {
        return sect_error(dev, h, dma);
    }

    let info2_mask = if dma {
        INFO2_MASK_ERR
    } else if writing {
        INFO2_MASK_BWE
    } else {
        INFO2_MASK_BRE
    };
    set_int_mask(dev, h, INFO1_ACCESS_END, info2_mask);

    let phase = if dma {
        dma_trans(dev, h, cnt)
    } else {
        software_trans(dev, h, xfer, cnt)
    };
    if phase.is_err() {
        return sect_error(dev, h, dma);
    }

    // access end closes the transaction; the sector counter issues the
    // stop command on multi-sector transfers
    if dev.int_wait(h.port, SD_TIMEOUT_RESP).is_err() {
        set_err(h, SdError::HostTimeout);
        return sect_error(dev, h, dma);
    }
    let (_, info2) = dev.int_status(h.port);
    if info2 & INFO2_MASK_ERR != 0 {
        check_info2_err(dev, h);
        return sect_error(dev, h, dma);
    }

    dev.clear_int(h.port, INFO1_ACCESS_END, 0);
    clear_int_mask(dev, h, INFO1_ACCESS_END, info2_mask);
    Ok(())
}

fn sect_error<D: SdDev>(dev: &mut D, h: &mut SdHandle, dma: bool) -> Result<(), SdError> {
    dev.stop_transfer(h.port);
    if dma {
        let _ = dev.disable_dma(h.port);
    }
    dev.clear_int(h.port, INFO1_ACCESS_END, INFO2_MASK_ERR);
    clear_int_mask(dev, h, INFO1_ACCESS_END, INFO2_MASK_BRE | INFO2_MASK_BWE);
    Err(h.error.unwrap_or(SdError::Failed))
}

/// CPU-driven data phase: one buffer-ready wait and one data-port copy
/// per sector. The first error stops the loop and is the result.
pub(crate) fn software_trans<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    mut xfer: Transfer<'_>,
    cnt: u32,
) -> Result<(), SdError> {
    for j in 0..cnt {
        if dev.int_wait(h.port, SD_TIMEOUT_MULTIPLE).is_err() {
            set_err(h, SdError::HostTimeout);
            break;
        }
        let (_, info2) = dev.int_status(h.port);
        if info2 & INFO2_MASK_ERR != 0 {
            check_info2_err(dev, h);
            break;
        }

        let off = j as usize * SECTOR_SIZE;
        let copied = match &mut xfer {
            Transfer::Read(buf) => {
                dev.clear_int(h.port, 0, INFO2_BRE);
                dev.read_data(h.port, &mut buf[off..off + SECTOR_SIZE])
            }
            Transfer::Write(buf) => {
                dev.clear_int(h.port, 0, INFO2_BWE);
                dev.write_data(h.port, &buf[off..off + SECTOR_SIZE])
            }
        };
        if copied.is_err() {
            set_err(h, SdError::CpuInterface);
            break;
        }
    }

    match h.error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// DMA data phase: wait out the transfer with a size-scaled timeout and
/// disarm the engine whatever the outcome.
pub(crate) fn dma_trans<D: SdDev>(dev: &mut D, h: &mut SdHandle, cnt: u32) -> Result<(), SdError> {
    if dev
        .wait_dma_end(h.port, cnt as usize * SECTOR_SIZE)
        .is_err()
    {
        let _ = dev.disable_dma(h.port);
        return Err(set_err(h, SdError::CpuInterface));
    }
    if dev.disable_dma(h.port).is_err() {
        return Err(set_err(h, SdError::CpuInterface));
    }
    Ok(())
}

fn lock_unlock_inner<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    op: LockOp<'_>,
) -> Result<(), SdError> {
    h.error = None;
    if h.mount == MountState::Unmounted {
        return Err(set_err(h, SdError::Failed));
    }

    let mut data = [0u8; 2 + LOCK_PWD_MAX];
    let len = match op {
        LockOp::ForceErase => {
            data[0] = LOCK_FORCE_ERASE;
            1
        }
        LockOp::SetPassword(pwd)
        | LockOp::ClearPassword(pwd)
        | LockOp::Lock(pwd)
        | LockOp::Unlock(pwd) => {
            if pwd.is_empty() || pwd.len() > LOCK_PWD_MAX {
                return Err(set_err(h, SdError::OutOfRange));
            }
            data[0] = match op {
                LockOp::SetPassword(_) => LOCK_SET_PWD,
                LockOp::ClearPassword(_) => LOCK_CLR_PWD,
                LockOp::Lock(_) => LOCK_LOCK | LOCK_SET_PWD,
                _ => 0,
            };
            data[1] = pwd.len() as u8;
            data[2..2 + pwd.len()].copy_from_slice(pwd);
            2 + pwd.len()
        }
    };

    // the control structure travels as a short data block
    send_cmd_arg(dev, h, CMD16, RespKind::R1, 0, len as u16)?;
    let wrote = write_byte(dev, h, CMD42, 0, 0, &data[..len]);
    // block length back to the sector size whatever happened above
    let restored = send_cmd_arg(dev, h, CMD16, RespKind::R1, 0, SECTOR_SIZE as u16);
    wrote?;
    restored
}
