//! Tests for the versioned cache: TTL aging, pattern invalidation, version
//! bumps

use mcphub::store::cache::LayerCache;
use serde_json::json;
use std::time::Duration;

fn cache() -> LayerCache {
    LayerCache::new(1, Duration::from_secs(300))
}

#[test]
fn test_set_get_delete() {
    let cache = cache();
    cache.set("tool", "echo", json!({"name": "echo"}));

    assert_eq!(cache.get("tool", "echo"), Some(json!({"name": "echo"})));
    assert!(cache.delete("tool", "echo"));
    assert_eq!(cache.get("tool", "echo"), None);
}

#[test]
fn test_namespaces_do_not_collide() {
    let cache = cache();
    cache.set("tool", "x", json!(1));
    cache.set("prompt", "x", json!(2));

    assert_eq!(cache.get("tool", "x"), Some(json!(1)));
    assert_eq!(cache.get("prompt", "x"), Some(json!(2)));
}

#[test]
fn test_ttl_expiry() {
    let cache = cache();
    cache.set_with_ttl("search", "q1", json!("hit"), Duration::from_millis(20));
    assert_eq!(cache.get("search", "q1"), Some(json!("hit")));

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get("search", "q1"), None);
}

#[test]
fn test_pattern_invalidation_scoped_to_namespace() {
    let cache = cache();
    cache.set("tool_list", "_", json!([1]));
    cache.set("tool_list", "org-a", json!([2]));
    cache.set("search", "q", json!([3]));
    cache.set("skill", "calendar", json!([4]));

    let removed = cache.invalidate_pattern("tool_list:*");
    assert_eq!(removed, 2);
    assert_eq!(cache.get("tool_list", "_"), None);
    assert_eq!(cache.get("search", "q"), Some(json!([3])));
    assert_eq!(cache.get("skill", "calendar"), Some(json!([4])));
}

#[test]
fn test_version_bump_invalidates_everything_at_once() {
    let cache = cache();
    cache.set("tool", "a", json!(1));
    cache.set("search", "b", json!(2));

    let new_version = cache.bump_version();
    assert_eq!(new_version, 2);

    // All prior-version reads miss in one logical step.
    assert_eq!(cache.get("tool", "a"), None);
    assert_eq!(cache.get("search", "b"), None);

    // New writes land under the new version and do not conflict with the
    // stale keys still aging out.
    cache.set("tool", "a", json!(3));
    assert_eq!(cache.get("tool", "a"), Some(json!(3)));

    // Sweep drops the orphaned prior-version entries.
    let swept = cache.sweep();
    assert_eq!(swept, 2);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_large_invalidation_runs_in_batches() {
    let cache = cache();
    for i in 0..450 {
        cache.set("search", &format!("q{i}"), json!(i));
    }
    cache.set("tool", "stay", json!("here"));

    let removed = cache.invalidate_pattern("search:*");
    assert_eq!(removed, 450);
    assert_eq!(cache.get("tool", "stay"), Some(json!("here")));
}
