//! Per-listener relay sessions and the response streams that feed them.

pub mod session;
pub mod stream;

pub use session::{SessionManager, SessionStatus, StreamSession};
pub use stream::SessionStream;
