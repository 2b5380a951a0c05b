//! Typed message envelope, header flags, and the serialization/compression/
//! encryption codec.

pub mod codec;
pub mod envelope;
pub mod flags;
pub mod types;

pub use codec::{CodecConfig, MessageCodec};
pub use envelope::Envelope;
pub use flags::MessageFlags;
pub use types::{MessageType, PropertyMap, TypeTag};
