use thiserror::Error as ThisError;

/// Usage errors rejected when a controller is built or a transfer is registered.
///
/// I/O failures are never wrapped in this type; they surface as [`std::io::Error`] from the
/// tracked reader exactly as the source produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum Error {
    #[error("bandwidth budget must be a positive number of bytes per second")]
    ZeroBudget,
    #[error("declared transfer size must be a positive number of bytes")]
    ZeroDeclaredSize,
}
