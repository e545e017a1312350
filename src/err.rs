// ===== Types and Structures =====

use core::fmt;

/// Driver error codes. Callers branch on these, so the set is closed and
/// stable: card negotiation failures keep their own kinds instead of being
/// folded into a generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdError {
    /// Unrefined failure (bad parameter, uninitialized port, missing work
    /// buffer).
    Failed,
    /// No card present on the selected port.
    NoCard,
    /// The board-level shim rejected a register or DMA operation.
    CpuInterface,
    /// Host-side interrupt wait expired.
    HostTimeout,
    /// The card did not answer in time (response or data timeout).
    CardTimeout,
    /// CRC error on the command or data line.
    CardCrc,
    /// Missing end bit in a response or data block.
    CardEndBit,
    /// The card is password-locked.
    CardLocked,
    /// Neither SD nor MMC negotiation succeeded, or the card never left
    /// the reserved relative address.
    CardTypeUnsupported,
    /// CMD8 answered with an unexpected interface version.
    IfCondVersion,
    /// CMD8 echoed the wrong check pattern.
    IfCondEcho,
    /// Address or length outside the device.
    OutOfRange,
    /// The card status word reported an error condition.
    CardError,
    /// Sector write rejected by write protection.
    WriteProtected,
    /// The single flash file slot is already open.
    DeviceBusy,
    /// Flash page programming failed.
    Io,
}

impl fmt::Display for SdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdError::Failed => write!(f, "operation failed"),
            SdError::NoCard => write!(f, "no card detected"),
            SdError::CpuInterface => write!(f, "CPU interface fault"),
            SdError::HostTimeout => write!(f, "host timeout"),
            SdError::CardTimeout => write!(f, "card timeout"),
            SdError::CardCrc => write!(f, "card CRC error"),
            SdError::CardEndBit => write!(f, "card end bit error"),
            SdError::CardLocked => write!(f, "card is locked"),
            SdError::CardTypeUnsupported => write!(f, "unsupported card type"),
            SdError::IfCondVersion => write!(f, "interface condition version mismatch"),
            SdError::IfCondEcho => write!(f, "interface condition echo mismatch"),
            SdError::OutOfRange => write!(f, "address out of range"),
            SdError::CardError => write!(f, "card status error"),
            SdError::WriteProtected => write!(f, "card is write protected"),
            SdError::DeviceBusy => write!(f, "device is busy"),
            SdError::Io => write!(f, "I/O error"),
        }
    }
}
