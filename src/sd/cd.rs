use log::debug;

use crate::err::SdError;

use super::{Sdhi, SdHandle, constant::*, dev::{CdLayout, SdDev}};

/// Detect-event handler. Registered per port; a new registration replaces
/// the previous one.
pub type CdCallback = fn(port: u32, inserted: bool);

impl<'b, D: SdDev> Sdhi<'b, D> {
    /// Is a card seated in the port? Boards without a detect layout are
    /// treated as fixed media, always present. Fails without touching the
    /// hardware when the port was never initialized.
    pub fn check_media(&self, port: u32) -> Result<bool, SdError> {
        let idx = super::port_index(port)?;
        let h = self.handles[idx].as_ref().ok_or(SdError::Failed)?;
        Ok(check_media_h(&self.dev, h))
    }

    /// Enable or disable the insertion/removal interrupt and register the
    /// callback it should fire. No debouncing happens here; callers
    /// re-poll [`Sdhi::check_media`] on an event.
    pub fn cd_int(
        &mut self,
        port: u32,
        enable: bool,
        callback: Option<CdCallback>,
    ) -> Result<(), SdError> {
        let (dev, h) = self.parts(port)?;

        // drop stale edges when detection comes up from scratch
        if h.int_info1_mask & (INFO1_MASK_DET_CD | INFO1_MASK_DET_DAT3) == 0 {
            dev.clear_int(h.port, INFO1_MASK_DET_CD | INFO1_MASK_DET_DAT3, 0);
        }

        if let Some(layout) = dev.cd_layout(h.port) {
            let mask = match layout {
                CdLayout::Cd => INFO1_MASK_DET_CD,
                CdLayout::Dat3 => INFO1_MASK_DET_DAT3,
            };
            dev.set_cd_int(h.port, layout, enable);
            if enable {
                super::cmd::set_int_mask(dev, h, mask, 0);
            } else {
                super::cmd::clear_int_mask(dev, h, mask, 0);
            }
        }

        h.cd_callback = callback;
        debug!("port{}: detect interrupt {}", port, if enable { "on" } else { "off" });
        Ok(())
    }

    /// Deliver a detect edge to the registered callback. Board interrupt
    /// glue calls this after acknowledging the hardware event.
    pub fn dispatch_cd_event(&mut self, port: u32, inserted: bool) -> Result<(), SdError> {
        let (_, h) = self.parts(port)?;
        if let Some(cb) = h.cd_callback {
            cb(port, inserted);
        }
        Ok(())
    }
}

pub(crate) fn check_media_h<D: SdDev>(dev: &D, h: &SdHandle) -> bool {
    match dev.cd_layout(h.port) {
        Some(layout) => dev.cd_level(h.port, layout),
        // no detect wiring: fixed media, always present
        None => true,
    }
}
