//! Wire primitives shared by the codec and the multiplexer.

pub mod frame;
pub mod properties;
pub mod varint;

pub use frame::{flags, FrameHeader, MessageType, MAX_FRAME_SIZE};
pub use properties::{decode_properties, encode_properties, validate_property, DICTIONARY};
pub use varint::{read_varint, write_varint, MAX_VARINT_LEN};
