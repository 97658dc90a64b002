//! Transport plumbing shared by both sides

pub mod connection;
pub mod listener;

pub use connection::{read_frames, write_frames, ReadEnd};
pub use listener::{ConnectionHandler, SessionListener};
