use super::*;

use std::sync::atomic::{AtomicU32, Ordering};

static SEQ: AtomicU32 = AtomicU32::new(0);

fn temp_session_path() -> PathBuf {
    let n = SEQ.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("sochat-session-test-{}-{n}.json", std::process::id()))
}

#[test]
fn in_memory_store_starts_logged_out() {
    let store = SessionStore::in_memory();
    assert!(!store.is_logged_in());
    assert!(store.bearer().is_none());
    assert!(store.user_id().is_none());
}

#[test]
fn bearer_adds_prefix_only_when_missing() {
    let plain = SessionStore::with_credentials("abc123", "7");
    assert_eq!(plain.bearer().as_deref(), Some("Bearer abc123"));

    let prefixed = SessionStore::with_credentials("Bearer abc123", "7");
    assert_eq!(prefixed.bearer().as_deref(), Some("Bearer abc123"));
}

#[test]
fn save_then_reopen_round_trips_credentials() {
    let path = temp_session_path();
    let mut store = SessionStore::open(path.clone()).expect("open should succeed");
    store.save("tok-1", "14").expect("save should succeed");

    let reopened = SessionStore::open(path.clone()).expect("reopen should succeed");
    assert_eq!(reopened.user_id(), Some("14"));
    assert_eq!(reopened.bearer().as_deref(), Some("Bearer tok-1"));

    std::fs::remove_file(path).expect("cleanup");
}

#[test]
fn clear_removes_backing_file() {
    let path = temp_session_path();
    let mut store = SessionStore::open(path.clone()).expect("open should succeed");
    store.save("tok-2", "9").expect("save should succeed");
    assert!(path.exists());

    store.clear().expect("clear should succeed");
    assert!(!store.is_logged_in());
    assert!(!path.exists());

    let reopened = SessionStore::open(path).expect("reopen after clear");
    assert!(!reopened.is_logged_in());
}

#[test]
fn clear_on_logged_out_store_is_a_no_op() {
    let mut store = SessionStore::in_memory();
    store.clear().expect("clear should not fail");
    assert!(!store.is_logged_in());
}
