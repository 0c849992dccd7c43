use thiserror::Error;

/// Errors raised by the variance metric. All of them are detected
/// synchronously at call time, before any result is produced.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VarianceError {
    #[error("ensemble tensor needs at least (members, channels) axes, got shape {0:?}")]
    MissingAxes(Vec<usize>),

    #[error("shape {shape:?} implies {expected} values but {found} were provided")]
    ValueCount {
        shape: Vec<usize>,
        expected: usize,
        found: usize,
    },

    #[error("ensemble axis is empty: at least one member is required")]
    EmptyEnsemble,

    #[error("include_background=false needs at least 2 channels, got {0}")]
    BackgroundOnly(usize),

    #[error("invalid threshold {0}: must be non-negative")]
    NegativeThreshold(f64),

    #[error("channel {channel} is out of range for {channels} channels")]
    ChannelOutOfRange { channel: usize, channels: usize },

    #[error("spatial shape {requested:?} does not cover {actual} locations")]
    SpatialMismatch { requested: Vec<usize>, actual: usize },
}
