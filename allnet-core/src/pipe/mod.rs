pub mod framing;
pub mod multiplexer;

pub use framing::{send, FrameReader, PipeIo, Priority, RecvOutcome, FRAME_MAGIC};
pub use multiplexer::{FdId, MuxOutcome, Multiplexer, Wait};
