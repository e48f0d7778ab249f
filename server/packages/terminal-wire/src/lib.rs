//! Client for browser-terminal daemons.
//!
//! Every outbound message is a single op-code byte followed by a payload:
//! `'0'` carries raw input bytes, `'1'` carries a JSON `{"columns","rows"}`
//! resize. Output coming back from the daemon is passed through unparsed.

pub mod client;
pub mod frame;
pub mod keys;

pub use client::{ConnectError, SendError, TerminalClient, TerminalClientConfig, TerminalOutput};
pub use frame::{handshake_message, FrameError, TerminalFrame, TerminalSize, OP_INPUT, OP_RESIZE};
pub use keys::{control_sequence, key_bytes};
