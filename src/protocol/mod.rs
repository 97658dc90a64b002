//! Controller/satellite wire protocol

pub mod codec;
pub mod message;

pub use codec::{decode_frame, encode_frame, frame_codec, MAX_FRAME_LENGTH};
pub use message::*;
