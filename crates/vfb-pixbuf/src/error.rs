use thiserror::Error;

/// Errors from the frame transport.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ipc(#[from] vfb_ipc::Error),

    #[error("a {width}x{height} frame does not fit in the address space")]
    FrameTooLarge { width: i32, height: i32 },

    #[error("corrupt frame header in `{name}`: {width}x{height}")]
    CorruptHeader {
        name: String,
        width: i32,
        height: i32,
    },
}

impl Error {
    /// Timeouts, owner deaths and not-yet-ready segments clear up on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Ipc(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
