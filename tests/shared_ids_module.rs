use datapilot::shared::ids::{generate_turn_id, validate_identifier_value, ArtifactId, SessionId};

#[test]
fn identifier_validation_accepts_ascii_word_characters() {
    assert!(validate_identifier_value("session id", "sess-01_a").is_ok());
    assert!(validate_identifier_value("session id", "").is_err());
    assert!(validate_identifier_value("session id", "a b").is_err());
    assert!(validate_identifier_value("session id", "a/b").is_err());
}

#[test]
fn session_id_round_trips_through_serde() {
    let id = SessionId::parse("sess-1").expect("parse");
    let raw = serde_json::to_string(&id).expect("serialize");
    assert_eq!(raw, "\"sess-1\"");
    let back: SessionId = serde_json::from_str(&raw).expect("deserialize");
    assert_eq!(back, id);
}

#[test]
fn invalid_artifact_id_fails_deserialization() {
    let result: Result<ArtifactId, _> = serde_json::from_str("\"not valid!\"");
    assert!(result.is_err());
}

#[test]
fn turn_ids_are_unique_and_well_formed() {
    let a = generate_turn_id(1_700_000_000).expect("turn id");
    let b = generate_turn_id(1_700_000_000).expect("turn id");
    assert!(a.as_str().starts_with("turn-"));
    assert_ne!(a, b);
}
