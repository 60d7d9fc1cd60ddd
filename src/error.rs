use thiserror::Error;

/// Error code reported by [`DecodeError::code`] for a session aborted by a
/// source failure when the engine itself recorded no fault.
pub const ABORTED_CODE: i32 = -1;

#[derive(Error, Debug)]
pub enum DecodeError {
    /// The bytes do not parse as a supported image container.
    #[error("Invalid container: {0}")]
    InvalidContainer(&'static str),
    /// The underlying asynchronous reader failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    /// The decode engine reported a terminal error.
    #[error("Codec fault (code {code})")]
    CodecFault { code: i32 },
    /// A collaborator returned data the adapter cannot accept.
    #[error("Contract violation: {0}")]
    ContractViolation(String),
    #[error("Memory budget exhausted: requested {requested} bytes with a limit of {limit}")]
    MemoryExhausted { requested: u64, limit: u64 },
    #[error("Worker pool unavailable: {0}")]
    ThreadPool(String),
}

impl DecodeError {
    /// Stable numeric code for this error. Engine faults keep the engine's
    /// own code.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidContainer(_) => 1,
            Self::Io(_) => 2,
            Self::CodecFault { code } => *code,
            Self::ContractViolation(_) => 100,
            Self::MemoryExhausted { .. } => 101,
            Self::ThreadPool(_) => 102,
        }
    }
}
