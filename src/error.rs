/// Errors raised while receiving or decoding JK-BMS frames.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A start-marker byte did not match `0x4E 0x57`.
    #[error("invalid start marker byte 0x{byte:02X} at index {index}")]
    StartMarker { index: usize, byte: u8 },
    /// The declared frame length is outside the supported range.
    #[error("invalid frame length {0}")]
    FrameLength(u16),
    /// The end marker `0x68` was not found at its declared position.
    #[error("invalid end marker byte 0x{byte:02X} at index {index}")]
    EndMarker { index: usize, byte: u8 },
    /// The additive checksum did not match the transmitted value.
    #[error("checksum mismatch - computed=0x{computed:04X} received=0x{received:04X}")]
    Checksum { computed: u16, received: u16 },
    /// A field token in the reply body was not the expected one.
    #[error("unexpected field token 0x{found:02X} at index {index}, expected 0x{expected:02X}")]
    FieldToken {
        index: usize,
        expected: u8,
        found: u8,
    },
    /// The reply ended before all declared fields were read.
    #[error("reply truncated at index {0}")]
    Truncated(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
