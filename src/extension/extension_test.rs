use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::test_utils::RecordingEnvironment;
use crate::Error;

#[test]
fn first_registered_event_prefix_wins() {
    let mut registry = ExtensionRegistry::new();
    registry.register_event("foo", Arc::new(RecordingEnvironment::new()));
    registry.register_event("foo/bar", Arc::new(RecordingEnvironment::new()));

    let (event, _) = registry.for_key("/foo/bar/baz").unwrap();
    assert_eq!(event, "foo");
    assert!(registry.for_key("/other").is_none());
}

#[test]
fn configured_events_decide_dispatch_and_order() {
    let mut registry = ExtensionRegistry::new();
    registry.register_event("foo", Arc::new(RecordingEnvironment::new()));
    registry.register_event("foo/bar", Arc::new(RecordingEnvironment::new()));
    registry.register_event("baz", Arc::new(RecordingEnvironment::new()));

    registry.restrict_events(&["foo/bar".to_string(), "foo".to_string(), "missing".to_string()]);

    assert_eq!(registry.for_key("/foo/bar/x").unwrap().0, "foo/bar");
    assert_eq!(registry.for_key("/foo/x").unwrap().0, "foo");
    assert!(registry.for_key("/baz/x").is_none());
    assert!(registry.for_key("/missing/x").is_none());
}

#[test]
fn schema_environments_are_looked_up_by_id() {
    let mut registry = ExtensionRegistry::new();
    registry.register_schema("network", Arc::new(RecordingEnvironment::new()));

    assert!(registry.for_schema("network").is_some());
    assert!(registry.for_schema("subnet").is_none());
}

#[tokio::test]
async fn handle_event_passes_the_context() {
    let env = RecordingEnvironment::new();
    let mut context = Context::new();
    context.insert("key".into(), json!("/foo"));

    handle_event(&env, "notification", &mut context, None, None).await.unwrap();

    let calls = env.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "notification");
    assert_eq!(calls[0].1.get("key"), Some(&json!("/foo")));
    assert_eq!(calls[0].1.get("has_transaction"), Some(&json!(false)));
}

#[tokio::test]
async fn exception_in_context_becomes_an_error() {
    let env = RecordingEnvironment::raising("bad state");
    let mut context = Context::new();

    let err = handle_event(&env, "pre_state_update_in_transaction", &mut context, None, None)
        .await
        .unwrap_err();

    match err {
        Error::Extension(ExtensionError::Failed { event, message }) => {
            assert_eq!(event, "pre_state_update_in_transaction");
            assert_eq!(message, "bad state");
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn slow_extension_hits_time_limit() {
    let env = RecordingEnvironment::slow(Duration::from_secs(5));
    let mut context = Context::new();

    let err = handle_event(&env, "notification", &mut context, None, Some(Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::Extension(ExtensionError::Timeout { limit_ms: 1000, .. })
    ));
}
