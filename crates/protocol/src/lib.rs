//! Scribble Protocol
//!
//! Shared types for communication between the Scribble session server and
//! drawing clients. Drawing commands travel as length-prefixed binary
//! messages; login and session control travel as JSON inside `Command`
//! messages.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod codec;
pub mod server;
pub mod types;
pub mod version;

pub use client::{ClientCommand, SessionConfChanges};
pub use codec::MessageCodec;
pub use server::ServerReply;
pub use types::*;
pub use version::ProtocolVersion;

/// Generate a new unique session ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Is this a valid session ID or alias? (`[a-zA-Z0-9:-]{1,64}`)
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid_session_ids() {
        assert!(is_valid_session_id(&new_id()));
    }

    #[test]
    fn session_id_rules() {
        assert!(is_valid_session_id("abc123"));
        assert!(is_valid_session_id("my:vanity-id"));
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("has space"));
        assert!(!is_valid_session_id(&"x".repeat(65)));
    }
}
