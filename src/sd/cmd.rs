use log::{debug, trace};

use crate::err::SdError;

use super::{MediaType, SdHandle, SdSpec, constant::*, dev::SdDev};

/// Response shape of a command, fixed per command index by the bus
/// protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RespKind {
    None,
    R1,
    R1b,
    /// 136-bit response carrying the CID.
    R2Cid,
    /// 136-bit response carrying the CSD.
    R2Csd,
    /// OCR response, no CRC.
    R3,
    R6,
    R7,
}

/// Outcome of a bounded retry loop.
pub(crate) enum Retry<T> {
    Success(T),
    Exhausted(SdError),
}

/// Run `op` up to `attempts` times, stopping at the first success.
pub(crate) fn retry<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T, SdError>,
) -> Retry<T> {
    let mut last = SdError::Failed;
    for _ in 0..attempts {
        match op() {
            Ok(v) => return Retry::Success(v),
            Err(e) => last = e,
        }
    }
    Retry::Exhausted(last)
}

/// Record the first error of the running operation and hand it back.
/// Later errors in the same sequence do not overwrite the sticky value.
pub(crate) fn set_err(h: &mut SdHandle, e: SdError) -> SdError {
    if h.error.is_none() {
        h.error = Some(e);
    }
    e
}

pub(crate) fn split_arg(arg: u32) -> (u16, u16) {
    ((arg >> 16) as u16, arg as u16)
}

fn info2_error(info2: u64) -> SdError {
    if info2 & (INFO2_RESP_TIMEOUT | INFO2_DATA_TIMEOUT) != 0 {
        SdError::CardTimeout
    } else if info2 & INFO2_CRC_ERR != 0 {
        SdError::CardCrc
    } else if info2 & INFO2_END_ERR != 0 {
        SdError::CardEndBit
    } else {
        SdError::CardError
    }
}

/// Map and record whatever error the INFO2 flags currently carry.
pub(crate) fn check_info2_err<D: SdDev>(dev: &D, h: &mut SdHandle) -> SdError {
    let (_, info2) = dev.int_status(h.port);
    set_err(h, info2_error(info2))
}

/// Unmask interrupt sources, mirroring the mask into the session so the
/// presence monitor can tell what is enabled.
pub(crate) fn set_int_mask<D: SdDev>(dev: &mut D, h: &mut SdHandle, info1: u64, info2: u64) {
    h.int_info1_mask |= info1;
    h.int_info2_mask |= info2;
    dev.set_int_mask(h.port, info1, info2);
}

pub(crate) fn clear_int_mask<D: SdDev>(dev: &mut D, h: &mut SdHandle, info1: u64, info2: u64) {
    h.int_info1_mask &= !info1;
    h.int_info2_mask &= !info2;
    dev.clear_int_mask(h.port, info1, info2);
}

/// Issue one command and wait for the response end.
///
/// CRC and end-bit noise on CMD0/CMD8 is expected while probing an
/// uninitialized card and is not reported as a failure.
pub(crate) fn send_cmd<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    cmd: u16,
    arg_hi: u16,
    arg_lo: u16,
) -> Result<(), SdError> {
    trace!(
        "port{}: CMD{}{} arg {:#06x}_{:04x}",
        h.port,
        cmd & !SD_ACMD,
        if cmd & SD_ACMD != 0 { " (app)" } else { "" },
        arg_hi,
        arg_lo
    );

    dev.clear_int(h.port, INFO1_RESP_END, INFO2_MASK_ERR);
    set_int_mask(dev, h, INFO1_RESP_END, INFO2_MASK_ERR);
    dev.issue_cmd(h.port, cmd, arg_hi, arg_lo);
    let r = wait_resp(dev, h, cmd);
    clear_int_mask(dev, h, INFO1_RESP_END, INFO2_MASK_ERR);
    r
}

fn wait_resp<D: SdDev>(dev: &mut D, h: &mut SdHandle, cmd: u16) -> Result<(), SdError> {
    if dev.int_wait(h.port, SD_TIMEOUT_RESP).is_err() {
        return Err(set_err(h, SdError::HostTimeout));
    }
    let (_, info2) = dev.int_status(h.port);
    if info2 & INFO2_MASK_ERR != 0 {
        dev.clear_int(h.port, 0, INFO2_MASK_ERR);
        let e = info2_error(info2);
        if (cmd == CMD0 || cmd == CMD8)
            && matches!(e, SdError::CardCrc | SdError::CardEndBit)
        {
            return Ok(());
        }
        debug!("port{}: CMD{} failed: {}", h.port, cmd & !SD_ACMD, e);
        return Err(set_err(h, e));
    }
    dev.clear_int(h.port, INFO1_RESP_END, 0);
    Ok(())
}

/// Issue a command and decode its response into the session.
pub(crate) fn send_cmd_arg<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    cmd: u16,
    kind: RespKind,
    arg_hi: u16,
    arg_lo: u16,
) -> Result<(), SdError> {
    send_cmd(dev, h, cmd, arg_hi, arg_lo)?;
    get_resp(dev, h, kind)
}

/// Issue an application-specific command: APP_CMD addressed to the
/// current RCA, then the ACMD itself.
pub(crate) fn send_acmd<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    acmd: u16,
    arg_hi: u16,
    arg_lo: u16,
) -> Result<(), SdError> {
    let rca = h.rca;
    send_cmd(dev, h, CMD55, rca, 0)?;
    get_resp(dev, h, RespKind::R1)?;
    send_cmd(dev, h, acmd, arg_hi, arg_lo)
}

/// Capture and decode the response of the last command.
pub(crate) fn get_resp<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    kind: RespKind,
) -> Result<(), SdError> {
    let raw = dev.response(h.port);
    match kind {
        RespKind::None => Ok(()),
        RespKind::R1 | RespKind::R1b => {
            let status = ((raw[1] as u32) << 16) | raw[0] as u32;
            h.resp_status = status;
            check_resp_status(h, status)?;
            if kind == RespKind::R1b {
                wait_rbusy(dev, h, SD_RBUSY_POLL)?;
            }
            Ok(())
        }
        RespKind::R2Cid => {
            h.cid = raw;
            Ok(())
        }
        RespKind::R2Csd => {
            h.csd = raw;
            Ok(())
        }
        RespKind::R3 => {
            h.ocr = ((raw[1] as u32) << 16) | raw[0] as u32;
            Ok(())
        }
        RespKind::R6 => {
            h.rca = raw[1];
            h.resp_status = raw[0] as u32;
            Ok(())
        }
        RespKind::R7 => {
            h.if_cond = [raw[1], raw[0]];
            Ok(())
        }
    }
}

fn check_resp_status(h: &mut SdHandle, status: u32) -> Result<(), SdError> {
    if status & R1_ERRORS != 0 {
        let e = if status & R1_OUT_OF_RANGE != 0 {
            SdError::OutOfRange
        } else if status & R1_LOCK_UNLOCK_FAILED != 0 {
            SdError::CardLocked
        } else {
            SdError::CardError
        };
        return Err(set_err(h, e));
    }
    Ok(())
}

/// Poll the busy line until the card releases it.
pub(crate) fn wait_rbusy<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    limit: u32,
) -> Result<(), SdError> {
    for _ in 0..limit {
        if !dev.card_busy(h.port) {
            return Ok(());
        }
    }
    Err(set_err(h, SdError::CardTimeout))
}

/// Negotiate operating conditions: ACMD41 for SD media, CMD1 for MMC.
/// Loops until the card reports power-up completion or the retry count
/// runs out; a ready card also fixes the addressing mode from its CCS
/// bit.
pub(crate) fn send_ocr<D: SdDev>(
    dev: &mut D,
    h: &mut SdHandle,
    media: MediaType,
) -> Result<(), SdError> {
    let mut arg = h.voltage;
    if media.contains(MediaType::SD) && h.sd_spec >= SdSpec::V2_0 {
        arg |= OCR_HCS;
    }
    let (hi, lo) = split_arg(arg);

    for _ in 0..OCR_RETRY {
        if media.contains(MediaType::SD) {
            send_acmd(dev, h, ACMD41, hi, lo)?;
        } else {
            send_cmd(dev, h, CMD1, hi, lo)?;
        }
        get_resp(dev, h, RespKind::R3)?;
        if h.ocr & OCR_BUSY != 0 {
            h.block_addressing = h.ocr & OCR_CCS != 0;
            debug!("port{}: OCR {:#010x}", h.port, h.ocr);
            return Ok(());
        }
        // the card is still powering up internally
        let _ = dev.int_wait(h.port, OCR_POLL_WAIT);
    }
    Err(set_err(h, SdError::CardTimeout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_stops_on_first_success() {
        let mut calls = 0;
        let r = retry(3, || {
            calls += 1;
            if calls == 2 { Ok(calls) } else { Err(SdError::CardTimeout) }
        });
        assert!(matches!(r, Retry::Success(2)));
        assert_eq!(calls, 2);
    }

    #[test]
    fn retry_reports_last_error_on_exhaustion() {
        let mut calls = 0;
        let r: Retry<()> = retry(3, || {
            calls += 1;
            Err(SdError::CardCrc)
        });
        assert!(matches!(r, Retry::Exhausted(SdError::CardCrc)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn first_error_sticks() {
        let mut h = SdHandle::new(0);
        assert_eq!(set_err(&mut h, SdError::CardCrc), SdError::CardCrc);
        assert_eq!(set_err(&mut h, SdError::CardTimeout), SdError::CardTimeout);
        assert_eq!(h.error, Some(SdError::CardCrc));
    }

    #[test]
    fn info2_error_precedence() {
        assert_eq!(info2_error(INFO2_RESP_TIMEOUT | INFO2_CRC_ERR), SdError::CardTimeout);
        assert_eq!(info2_error(INFO2_CRC_ERR), SdError::CardCrc);
        assert_eq!(info2_error(INFO2_END_ERR), SdError::CardEndBit);
        assert_eq!(info2_error(INFO2_ILL_ACCESS), SdError::CardError);
    }

    #[test]
    fn arg_halves() {
        assert_eq!(split_arg(0x1234_5678), (0x1234, 0x5678));
    }
}
