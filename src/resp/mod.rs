pub mod parser;
pub mod types;
pub mod writer;

pub use parser::{decode, decode_slice, frame_len};
pub use types::Reply;
pub use writer::{encode_command, encode_pipeline};
