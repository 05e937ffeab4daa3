#![allow(clippy::unwrap_used, clippy::expect_used)]

use phasegate_core::*;

// ---------------------------------------------------------------------------
// 1. Agent output parsing
// ---------------------------------------------------------------------------

#[test]
fn findings_list_parses_from_agent_json() {
    let raw = r#"[
        {"severity": "HIGH", "message": "missing test", "location": "src/auth.rs"},
        {"severity": "LOW", "message": "typo", "remediation": "fix spelling"}
    ]"#;
    let findings: Vec<Finding> = serde_json::from_str(raw).unwrap();

    assert_eq!(findings.len(), 2);
    assert_eq!(findings[0].severity, Severity::High);
    assert_eq!(findings[0].location.as_deref(), Some("src/auth.rs"));
    assert_eq!(findings[1].remediation.as_deref(), Some("fix spelling"));
}

#[test]
fn unknown_severity_is_rejected() {
    let raw = r#"{"severity": "SEVERE", "message": "??"}"#;
    assert!(serde_json::from_str::<Finding>(raw).is_err());
}

// ---------------------------------------------------------------------------
// 2. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let config_err = PhasegateError::Config("unknown agent 'x'".to_string());
    assert_eq!(config_err.to_string(), "Config error: unknown agent 'x'");

    let exec_err = PhasegateError::Execution("timed out".to_string());
    assert_eq!(exec_err.to_string(), "Execution error: timed out");

    let io_err: PhasegateError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(io_err, PhasegateError::Io(_)));
    assert_eq!(io_err.exit_code(), 1);

    let json_err: PhasegateError = serde_json::from_str::<Finding>("{").unwrap_err().into();
    assert!(matches!(json_err, PhasegateError::Serialization(_)));
}

// ---------------------------------------------------------------------------
// 3. Capability model across the public API
// ---------------------------------------------------------------------------

#[test]
fn refactor_agent_covers_docs_phase_requirements_only_with_read() {
    let refactor = CapabilitySet::parse(&["read", "write:src"]).unwrap();
    let docs_phase = CapabilitySet::parse(&["read:src", "write:docs"]).unwrap();

    let missing = refactor.missing(&docs_phase);
    assert_eq!(missing, vec![Capability::write("docs")]);
    assert!(!refactor.covers(&docs_phase));
}

#[test]
fn empty_requirement_is_always_covered() {
    assert!(CapabilitySet::new().covers(&CapabilitySet::new()));
    assert!(CapabilitySet::parse(&["read"]).unwrap().covers(&CapabilitySet::new()));
}

#[test]
fn status_serializes_uppercase() {
    let json = serde_json::to_string(&WorkItemStatus::Blocked).unwrap();
    assert_eq!(json, "\"BLOCKED\"");
    let action: GateAction = serde_json::from_str("\"WARN\"").unwrap();
    assert_eq!(action, GateAction::Warn);
}
