pub mod codec;
pub mod constants;
pub mod error;
pub mod frame;
pub mod header;
pub mod limits;
pub mod op;
pub mod reassembler;
pub mod stream;
pub mod termination;
