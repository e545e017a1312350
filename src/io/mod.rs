//! Generic IO-device surface, the pluggable-backend contract the boot
//! flow loads images through. The xSPI flash driver in [`xspi`]
//! implements it.

pub mod xspi;

use crate::err::SdError;

/// Device-relative byte region handed to [`IoDevice::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpec {
    pub offset: u64,
    pub length: u64,
}

/// Seek origin. Only absolute positioning is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
    Set,
}

/// A device exposing file-like entities over fixed regions.
///
/// `Entity` is an owned token: it cannot be copied, and [`IoDevice::close`]
/// consumes it, so a closed handle cannot be reused.
pub trait IoDevice {
    type Entity;

    /// Open the region described by `spec`.
    fn open(&mut self, spec: &BlockSpec) -> Result<Self::Entity, SdError>;

    /// Move the cursor. The target offset must lie inside the region;
    /// violating that is a programming error, not a runtime fault.
    fn seek(&mut self, entity: &mut Self::Entity, mode: SeekMode, offset: i64)
    -> Result<(), SdError>;

    /// Length of the open region.
    fn len(&self, entity: &Self::Entity) -> Result<u64, SdError>;

    /// Read from the cursor; returns the number of bytes read. The range
    /// must lie inside the region.
    fn read(&mut self, entity: &mut Self::Entity, buf: &mut [u8]) -> Result<usize, SdError>;

    /// Write at the cursor; returns the number of bytes written. The
    /// range must lie inside the region.
    fn write(&mut self, entity: &mut Self::Entity, buf: &[u8]) -> Result<usize, SdError>;

    /// Release the entity.
    fn close(&mut self, entity: Self::Entity) -> Result<(), SdError>;
}
