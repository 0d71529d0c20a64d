//! Live voice conversation client
//!
//! Streams microphone audio to the Live API, plays the synthesized replies
//! back gaplessly (with barge-in), and keeps a transcript of both sides.
//! A presentation layer drives it through [`SessionController`] and renders
//! [`UiSnapshot`]s.

pub mod audio;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use session::{
    Connection, LiveBackend, SessionBackend, SessionController, SessionOptions, UiSnapshot,
};
pub use settings::{load_settings, save_settings, LiveSettings};
pub use state_machine::{Speaker, Status, TranscriptEntry};

#[cfg(test)]
mod tests {
    #[test]
    fn package_metadata_is_published() {
        assert!(!env!("CARGO_PKG_AUTHORS").is_empty());
        assert_eq!(env!("CARGO_PKG_LICENSE"), "AGPL-3.0-only");
        assert!(env!("CARGO_PKG_REPOSITORY").ends_with("/astra-live"));
    }
}
