//! SMB1/CIFS wire protocol: constants, header framing and string/time codecs.

pub mod codec;
pub mod constants;
pub mod header;

pub use constants::{Capabilities, HeaderFlags, HeaderFlags2};
pub use header::{AndX, ReplyBuf, Request, SmbHeader};
