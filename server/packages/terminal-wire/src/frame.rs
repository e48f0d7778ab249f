use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Op-code prefixing keyboard input.
pub const OP_INPUT: u8 = b'0';
/// Op-code prefixing a terminal resize.
pub const OP_RESIZE: u8 = b'1';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub columns: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            columns: 80,
            rows: 24,
        }
    }
}

/// One outbound message of the terminal protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalFrame {
    Input(Vec<u8>),
    Resize(TerminalSize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("empty frame")]
    Empty,
    #[error("unknown op-code {0:#04x}")]
    UnknownOpCode(u8),
    #[error("invalid resize payload: {0}")]
    InvalidResize(String),
}

impl TerminalFrame {
    pub fn input(text: impl AsRef<[u8]>) -> Self {
        Self::Input(text.as_ref().to_vec())
    }

    pub fn resize(columns: u16, rows: u16) -> Self {
        Self::Resize(TerminalSize { columns, rows })
    }

    pub fn op_code(&self) -> u8 {
        match self {
            Self::Input(_) => OP_INPUT,
            Self::Resize(_) => OP_RESIZE,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Input(payload) => {
                let mut out = Vec::with_capacity(payload.len() + 1);
                out.push(OP_INPUT);
                out.extend_from_slice(payload);
                out
            }
            Self::Resize(size) => {
                let mut out = vec![OP_RESIZE];
                // TerminalSize serializes to {"columns":..,"rows":..}; field order is fixed.
                out.extend(
                    serde_json::to_vec(size).unwrap_or_else(|_| {
                        format!(r#"{{"columns":{},"rows":{}}}"#, size.columns, size.rows)
                            .into_bytes()
                    }),
                );
                out
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (&op, payload) = bytes.split_first().ok_or(FrameError::Empty)?;
        match op {
            OP_INPUT => Ok(Self::Input(payload.to_vec())),
            OP_RESIZE => serde_json::from_slice(payload)
                .map(Self::Resize)
                .map_err(|err| FrameError::InvalidResize(err.to_string())),
            other => Err(FrameError::UnknownOpCode(other)),
        }
    }
}

/// First message sent after the socket opens. Daemons wait for it before
/// attaching the shell.
pub fn handshake_message(auth_token: Option<&str>, size: TerminalSize) -> Vec<u8> {
    #[derive(Serialize)]
    struct Handshake<'a> {
        #[serde(rename = "AuthToken")]
        auth_token: &'a str,
        columns: u16,
        rows: u16,
    }

    serde_json::to_vec(&Handshake {
        auth_token: auth_token.unwrap_or_default(),
        columns: size.columns,
        rows: size.rows,
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_uses_exact_json_layout() {
        let encoded = TerminalFrame::resize(80, 24).encode();
        assert_eq!(encoded[0], b'1');
        assert_eq!(&encoded[1..], br#"{"columns":80,"rows":24}"#);
    }

    #[test]
    fn input_prefixes_raw_bytes() {
        let encoded = TerminalFrame::input("ls -la\r").encode();
        assert_eq!(encoded, b"0ls -la\r".to_vec());
    }

    #[test]
    fn input_keeps_multibyte_utf8() {
        let encoded = TerminalFrame::input("héllo").encode();
        assert_eq!(&encoded[1..], "héllo".as_bytes());
    }

    #[test]
    fn decode_rejects_unknown_op_code() {
        assert_eq!(
            TerminalFrame::decode(b"9abc"),
            Err(FrameError::UnknownOpCode(b'9'))
        );
        assert_eq!(TerminalFrame::decode(b""), Err(FrameError::Empty));
    }

    #[test]
    fn handshake_defaults_to_empty_token() {
        let message = handshake_message(None, TerminalSize::default());
        assert_eq!(
            message,
            br#"{"AuthToken":"","columns":80,"rows":24}"#.to_vec()
        );
    }
}
