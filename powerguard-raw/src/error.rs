//! Errors raised by the pure register codecs

pub type Result<T> = std::result::Result<T, CodecError>;

/// Inputs a codec refuses to encode
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CodecError {
    #[error("Undervolt offset must be <= 0 mV, got {0} mV")]
    PositiveUndervolt(f64),

    #[error("Undervolt offset must be >= -1000 mV, got {0} mV")]
    UndervoltOutOfRange(f64),

    #[error("IccMax must be within (0, 255.75] A, got {0} A")]
    IccMaxOutOfRange(f64),

    #[error("Plane {0} has no current limit control")]
    NoCurrentControl(&'static str),

    #[error("Value for {field} is not a finite number")]
    NotFinite { field: &'static str },
}
