//! Wire protocol shared by the gateway, broker and worker: the token
//! parser, per-command descriptors, frame framing and error kinds. Each
//! command is declared once and both sides use the same descriptor for
//! parse and format.

pub mod command;
pub mod error;
pub mod message;
pub mod tokens;
pub mod version;
pub mod wellknown;

pub use command::{is_client_command, CommandError, LoadCommand, TileCombineRequest, TileRequest};
pub use error::{error_frame, ErrorKind};
pub use message::{abbreviate, nextmessage_prelude, parse_nextmessage, Frame, SMALL_MESSAGE_SIZE};
pub use tokens::{first_line, token_int, token_string, Tokens};
pub use version::{parse_version, protocol_version, PROTOCOL_MAJOR, PROTOCOL_MINOR};
pub use wellknown::{encode_session_id, session_index};
