#![forbid(unsafe_code)]

use kube::core::DynamicObject;

use operon_core::{ChangeKind, Notification, ObjectKey, OwnerRef, Payload};
use operon_store::new_store;
use operon_watch::{controller_owner, extract_key, to_observed, OwnedTracker, PrimaryTracker, Tracker};

fn dyn_obj(v: serde_json::Value) -> DynamicObject {
    serde_json::from_value(v).expect("valid object")
}

fn primary(ns: &str, name: &str, rv: &str) -> DynamicObject {
    dyn_obj(serde_json::json!({
        "apiVersion": "example.io/v1alpha1",
        "kind": "RedisCluster",
        "metadata": {
            "name": name,
            "namespace": ns,
            "uid": "u-primary",
            "resourceVersion": rv,
            "creationTimestamp": "2024-05-01T10:00:00Z",
            "managedFields": [{"manager": "operator"}],
        },
        "spec": {"members": 3},
    }))
}

fn child(ns: &str, name: &str, owner: Option<(&str, &str, bool)>) -> DynamicObject {
    let mut meta = serde_json::json!({
        "name": name,
        "namespace": ns,
        "uid": "u-child",
        "resourceVersion": "9",
    });
    if let Some((kind, owner_name, controller)) = owner {
        meta["ownerReferences"] = serde_json::json!([{
            "apiVersion": "example.io/v1alpha1",
            "kind": kind,
            "name": owner_name,
            "uid": "u-owner",
            "controller": controller,
        }]);
    }
    dyn_obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": meta,
    }))
}

#[test]
fn extract_key_uses_identity_fields_only() {
    let key = extract_key(&primary("prod", "main", "1")).unwrap();
    assert_eq!(key, ObjectKey::namespaced("prod", "main"));

    let cluster_scoped = dyn_obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Node",
        "metadata": {"name": "node-1", "uid": "u-n"},
    }));
    assert_eq!(
        extract_key(&cluster_scoped).unwrap(),
        ObjectKey::cluster("node-1")
    );
}

#[test]
fn extract_key_rejects_missing_name() {
    let nameless = dyn_obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"namespace": "prod", "uid": "u"},
    }));
    assert!(extract_key(&nameless).is_err());
}

#[test]
fn controller_owner_requires_matching_kind_and_controller_flag() {
    let owned = child("prod", "pod-1", Some(("RedisCluster", "main", true)));
    assert_eq!(
        controller_owner(&owned, "RedisCluster"),
        Some(OwnerRef {
            kind: "RedisCluster".into(),
            name: "main".into(),
        })
    );

    let wrong_kind = child("prod", "pod-2", Some(("Deployment", "web", true)));
    assert_eq!(controller_owner(&wrong_kind, "RedisCluster"), None);

    let not_controller = child("prod", "pod-3", Some(("RedisCluster", "main", false)));
    assert_eq!(controller_owner(&not_controller, "RedisCluster"), None);

    let no_owner = child("prod", "pod-4", None);
    assert_eq!(controller_owner(&no_owner, "RedisCluster"), None);
}

#[test]
fn to_observed_snapshots_version_and_strips_managed_fields() {
    let obs = to_observed(&primary("prod", "main", "42")).unwrap();
    assert_eq!(obs.key, ObjectKey::namespaced("prod", "main"));
    assert_eq!(obs.resource_version, "42");
    assert_eq!(obs.creation_ts, 1_714_557_600);
    assert!(obs.raw["metadata"].get("managedFields").is_none());
    assert_eq!(obs.raw["spec"]["members"], 3);
}

#[test]
fn primary_tracker_updates_cache_before_notifying() {
    let (writer, store) = new_store();
    let mut t = PrimaryTracker::new(writer);

    let note = t.apply(to_observed(&primary("prod", "main", "1")).unwrap());
    let key = ObjectKey::namespaced("prod", "main");
    // by the time the notification exists, the cache already has the object
    assert_eq!(store.get(&key).unwrap().resource_version, "1");
    match note {
        Notification::Primary {
            kind: ChangeKind::Added,
            payload: Payload::Full(o),
        } => assert_eq!(o.key, key),
        other => panic!("unexpected notification: {other:?}"),
    }

    let note = t.apply(to_observed(&primary("prod", "main", "2")).unwrap());
    assert!(matches!(
        note,
        Notification::Primary {
            kind: ChangeKind::Updated,
            ..
        }
    ));
    assert_eq!(store.get(&key).unwrap().resource_version, "2");

    let note = t.delete(to_observed(&primary("prod", "main", "2")).unwrap());
    assert!(store.get(&key).is_none());
    match note {
        Notification::Primary {
            kind: ChangeKind::Deleted,
            payload: Payload::Full(o),
        } => assert_eq!(o.resource_version, "2"),
        other => panic!("unexpected notification: {other:?}"),
    }
}

#[test]
fn primary_replay_emits_tombstones_for_vanished_objects() {
    let (writer, store) = new_store();
    let mut t = PrimaryTracker::new(writer);
    t.apply(to_observed(&primary("prod", "a", "1")).unwrap());
    t.apply(to_observed(&primary("prod", "b", "1")).unwrap());

    let notes = t.replay(vec![
        to_observed(&primary("prod", "b", "2")).unwrap(),
        to_observed(&primary("prod", "c", "1")).unwrap(),
    ]);

    let tombstones: Vec<_> = notes
        .iter()
        .filter_map(|n| match n {
            Notification::Primary {
                kind: ChangeKind::Deleted,
                payload: Payload::Tombstone(k),
            } => Some(k.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tombstones, vec![ObjectKey::namespaced("prod", "a")]);

    let adds = notes
        .iter()
        .filter(|n| {
            matches!(
                n,
                Notification::Primary {
                    kind: ChangeKind::Added,
                    ..
                }
            )
        })
        .count();
    assert_eq!(adds, 2);

    assert!(store.get(&ObjectKey::namespaced("prod", "a")).is_none());
    assert_eq!(
        store
            .get(&ObjectKey::namespaced("prod", "b"))
            .unwrap()
            .resource_version,
        "2"
    );
    assert!(store.get(&ObjectKey::namespaced("prod", "c")).is_some());
}

#[test]
fn owned_tracker_recovers_owner_for_tombstones() {
    let mut t = OwnedTracker::new("RedisCluster");
    let key = ObjectKey::namespaced("prod", "pod-1");
    let owner = OwnerRef {
        kind: "RedisCluster".into(),
        name: "main".into(),
    };

    t.apply(key.clone(), Some(owner.clone()));

    // tombstone delete arrives without a body; last known owner fills in
    let note = t.delete(key.clone(), None);
    match note {
        Notification::Owned {
            kind: ChangeKind::Deleted,
            owner: got,
            ..
        } => assert_eq!(got, Some(owner)),
        other => panic!("unexpected notification: {other:?}"),
    }

    // a key never seen before has nothing to recover
    let note = t.delete(ObjectKey::namespaced("prod", "stranger"), None);
    assert!(matches!(
        note,
        Notification::Owned { owner: None, .. }
    ));
}

#[test]
fn owned_replay_diffs_against_last_known_state() {
    let mut t = OwnedTracker::new("RedisCluster");
    let gone = ObjectKey::namespaced("prod", "pod-old");
    let owner = OwnerRef {
        kind: "RedisCluster".into(),
        name: "main".into(),
    };
    t.apply(gone.clone(), Some(owner.clone()));

    let notes = t.replay(vec![(ObjectKey::namespaced("prod", "pod-new"), Some(owner.clone()))]);
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().any(|n| matches!(
        n,
        Notification::Owned { kind: ChangeKind::Deleted, key, owner: Some(_) } if *key == gone
    )));
    assert!(notes.iter().any(|n| matches!(
        n,
        Notification::Owned { kind: ChangeKind::Added, key, .. } if key.name == "pod-new"
    )));
}

#[test]
fn tracker_drops_malformed_objects_without_notifying() {
    let mut t = Tracker::Owned(OwnedTracker::new("RedisCluster"));
    let nameless = dyn_obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"namespace": "prod", "uid": "u"},
    }));
    assert!(t.handle_applied(&nameless).is_none());
    assert!(t.handle_deleted(&nameless).is_none());
    assert!(t.handle_replay(std::slice::from_ref(&nameless)).is_empty());
}

#[test]
fn tracker_replay_converts_whole_collections() {
    let (writer, store) = new_store();
    let mut t = Tracker::Primary(PrimaryTracker::new(writer));
    let objs = vec![primary("prod", "a", "1"), primary("prod", "b", "1")];
    let notes = t.handle_replay(&objs);
    assert_eq!(notes.len(), 2);
    assert_eq!(store.len(), 2);
}
