//! Stream codecs
//!
//! Row framing splits a byte stream into rows; the control-row codec tells
//! control rows apart from data rows and converts them to markers.

mod control;
mod framing;

pub use control::*;
pub use framing::*;
