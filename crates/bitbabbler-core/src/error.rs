//! Top-level error type composing the crate's leaf error enums.

use thiserror::Error;

use crate::ftdi::FtdiError;
use crate::group::GroupSaturated;
use crate::usb::UsbFault;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Usb(#[from] UsbFault),
    #[error(transparent)]
    Ftdi(#[from] FtdiError),
    #[error(transparent)]
    Group(#[from] GroupSaturated),
}
