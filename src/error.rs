//! Typed failure modes that cross a component boundary. Transient network
//! errors, protocol desync, and decode failures are deliberately absent —
//! per the error-handling design, they are recovered locally and never
//! surface as `Err` (see the component modules for where they're handled).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("payload of {0} bytes exceeds the 65535-byte frame limit")]
    OversizedPayload(usize),

    #[error("generation failed after {attempts} attempts: {source}")]
    GenerationFailed {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
}
