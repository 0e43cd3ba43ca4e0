//! Unit tests for error classification and retry delays

use std::time::Duration;

use arango_operator::arangod::ArangoError;
use arango_operator::controller::{BackoffConfig, Error, ErrorClass, classify};

use crate::common::*;

#[test]
fn test_database_errors() {
    assert!(arango_unavailable().is_temporary());
    assert!(!arango_unauthorized().is_temporary());
    assert!(ArangoError::Connection("refused".to_string()).is_temporary());
    assert!(ArangoError::Timeout("30s".to_string()).is_temporary());
    assert!(!ArangoError::InvalidResponse("garbage".to_string()).is_temporary());

    assert!(backup_not_found().is_not_found());
    assert!(!arango_unavailable().is_not_found());
    let missing_document = ArangoError::Response {
        code: 400,
        error_num: 1202,
        message: "document not found".to_string(),
    };
    assert!(missing_document.is_not_found());
}

#[test]
fn test_wrapped_database_errors_keep_their_class() {
    assert_eq!(classify(&Error::from(arango_unavailable())), ErrorClass::Temporary);
    assert_eq!(classify(&Error::from(arango_unauthorized())), ErrorClass::Permanent);
    assert_eq!(Error::from(arango_unavailable()).reason(), "DatabaseError");
}

#[test]
fn test_kubernetes_errors() {
    for code in [408, 409, 429, 500, 503] {
        assert!(api_error(code).is_temporary(), "{} should be retried", code);
    }
    for code in [400, 403, 404, 422] {
        assert!(!api_error(code).is_temporary(), "{} should not be retried", code);
    }

    assert!(conflict_error().is_conflict());
    assert_eq!(conflict_error().reason(), "Conflict");
    assert_eq!(api_error(500).reason(), "KubernetesError");
    assert!(api_error(404).is_not_found());
}

#[test]
fn test_operator_errors() {
    assert!(Error::TransientError("blip".to_string()).is_temporary());
    assert!(!Error::ValidationError("bad".to_string()).is_temporary());
    assert!(!Error::UnsupportedUpgrade("3.6".to_string()).is_temporary());
    assert!(!Error::PermanentError("no".to_string()).is_temporary());

    let missing = Error::NotFound("ArangoDeployment db".to_string());
    assert!(missing.is_not_found());
    assert!(!missing.is_temporary());
    assert_eq!(Error::ValidationError("bad".to_string()).reason(), "InvalidSpec");
}

#[test]
fn test_backoff_without_jitter() {
    let backoff = BackoffConfig {
        jitter: 0.0,
        ..Default::default()
    };
    assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(5));
    assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
    assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(40));
    assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(300));
}

#[test]
fn test_backoff_jitter_stays_in_range() {
    let backoff = BackoffConfig::default();
    for _ in 0..50 {
        let delay = backoff.delay_for_attempt(2).as_secs_f64();
        assert!((18.0..=22.0).contains(&delay), "delay {} out of range", delay);
    }
}
