use thiserror::Error;

use crate::brick::BrickId;

/// Every failure kind the engine surfaces at a component boundary.
///
/// Mirrors the single `thiserror`-derived error enum per component used throughout the
/// storage/HAL layers this crate grew out of (`HalStorageOperationErr`, `GPTErr`,
/// `HalFsIOErr`), collapsed into one crate-wide type since every component here shares one
/// caller-facing contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("brick {0:?} has no space left for the requested reservation")]
    NoSpace(BrickId),

    #[error("i/o error on brick {0:?}")]
    Io(BrickId),

    #[error("corrupt on-disk structure: {0}")]
    Corrupt(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("volume is busy")]
    Busy,

    #[error("operation must be retried")]
    Again,

    #[error("lock ordering would deadlock, drop longterm locks and retry")]
    Deadlock,

    #[error("no such brick or volume")]
    NotFound,

    #[error("brick is already registered")]
    AlreadyRegistered,

    #[error("brick is still activated")]
    StillActivated,

    #[error("unknown plugin id {0}")]
    UnknownPlugin(u8),

    #[error("volume parameter mismatch: {0}")]
    ParameterMismatch(&'static str),

    #[error("serialization buffer too small")]
    SerBufferTooSmall,

    #[error("deserialization buffer wrong size")]
    DeWrongBufferSize,
}

impl From<dvida_serialize::DvSerErr> for Error {
    fn from(_: dvida_serialize::DvSerErr) -> Self {
        Error::SerBufferTooSmall
    }
}

impl From<dvida_serialize::DvDeErr> for Error {
    fn from(_: dvida_serialize::DvDeErr) -> Self {
        Error::DeWrongBufferSize
    }
}

pub type Result<T> = core::result::Result<T, Error>;
