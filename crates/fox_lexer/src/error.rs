use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LexError {
    #[error("unterminated string at line {line}")]
    UnterminatedString { line: u32 },

    #[error("unexpected byte {byte:#04x} at line {line}")]
    UnexpectedByte { byte: u8, line: u32 },
}
