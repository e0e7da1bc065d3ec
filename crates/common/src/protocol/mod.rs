mod close;
mod handshake;

pub use close::CloseFrame;
pub use handshake::PipeInfo;
