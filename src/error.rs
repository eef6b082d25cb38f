//! Error types surfaced at the host API boundary.
//!
//! Guest-visible failures (DMA illegal transfers, buffer-full, MIDI
//! overflow) never reach these types; they become interrupt or HIRQ bits
//! and flow through the normal guest protocol.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// A component tried to register more scheduler events than the
    /// static capacity allows. Raised during bring-up only.
    #[error("scheduler event capacity exceeded ({0} registered)")]
    TooManyEvents(usize),

    /// A save-state record failed validation; no state was modified.
    #[error("invalid save state: {0}")]
    InvalidState(&'static str),

    /// The save state was produced with a different disc inserted.
    #[error("save state disc hash mismatch")]
    DiscHashMismatch,

    /// The save state was captured while executing IPL ROM code and no
    /// matching IPL image is loaded.
    #[error("save state IPL ROM hash mismatch")]
    IplHashMismatch,

    /// A backup memory or cartridge image has the wrong size or header.
    #[error("invalid memory image: {0}")]
    InvalidImage(&'static str),

    /// Host I/O failure while loading or persisting an image.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
