pub mod console;
pub mod session;

pub use session::{CHAT_PROTOCOL, ChatSessions, SessionError};
