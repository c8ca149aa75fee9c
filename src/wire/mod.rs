//! Wire Client (A): the HA WebSocket protocol client. See spec §4.1.

mod actor;
pub mod messages;
mod model;

pub use actor::WireClient;
pub use messages::*;
pub use model::{looks_like_timestamp, RawEntityState, StateChangedEvent};

#[cfg(test)]
mod tests {
    use super::model::*;

    #[test]
    fn timestamp_heuristic_matches_iso8601_prefix() {
        assert!(looks_like_timestamp("2024-01-01T00:00:00Z"));
        assert!(!looks_like_timestamp("on"));
        assert!(!looks_like_timestamp("24-01-01"));
    }

    #[test]
    fn rejects_non_object_frames() {
        let err = json_object_from_text_msg("c1", b"[1,2,3]").unwrap_err();
        assert!(matches!(err, crate::errors::WireError::Parse(_)));
    }
}
