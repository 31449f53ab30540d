//! Data module: buffers, reduction opcodes and completion status

pub mod buffer;
pub mod opcode;
pub mod status;

pub use buffer::{Buffer, BufferMut, ElemType, Element, OwnedBuffer};
pub use opcode::{Opcode, opcode_name};
pub use status::Status;
