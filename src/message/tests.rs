use super::{ClusterMemberInfo, ClusterMessage, JsonMessageFormatter, MessageFormatter};
use crate::config::ClusterSettings;
use crate::utils::error::BusError;

#[test]
fn member_info_from_settings() {
    let settings = ClusterSettings {
        cluster_id: "prod".to_string(),
        cluster_member_id: "web-1".to_string(),
        instance_id: "abc".to_string(),
    };
    let member = ClusterMemberInfo::from(&settings);
    assert_eq!(member.cluster_id, "prod");
    assert_eq!(member.cluster_member_id, "web-1");
    assert_eq!(member.instance_id, "abc");
}

#[test]
fn new_members_get_distinct_instance_ids() {
    assert_ne!(
        ClusterMemberInfo::new().instance_id,
        ClusterMemberInfo::new().instance_id
    );
}

#[test]
fn is_from_compares_instance_ids() {
    let me = ClusterMemberInfo::new();
    let other = ClusterMemberInfo::new();
    let msg = ClusterMessage::new(me.clone(), "Ping", "ping-42");
    assert!(msg.is_from(&me));
    assert!(!msg.is_from(&other));
}

#[test]
fn json_formatter_preserves_the_envelope() {
    let formatter = JsonMessageFormatter;
    let msg = ClusterMessage::new(
        ClusterMemberInfo::new(),
        "CacheInvalidation",
        "{\"key\":\"users/42\"}",
    )
    .debug();

    let bytes = formatter.serialize(&msg).unwrap();
    let parsed = formatter.deserialize(&bytes).unwrap();
    assert_eq!(parsed, msg);
    assert!(parsed.is_debug);
}

#[test]
fn json_formatter_rejects_garbage() {
    let err = JsonMessageFormatter.deserialize(b"not json").unwrap_err();
    assert!(matches!(err, BusError::Format(_)));
}

#[test]
fn is_debug_defaults_to_false() {
    let json = r#"{
        "sender": {"cluster_id": "", "cluster_member_id": "", "instance_id": "x"},
        "kind": "Ping",
        "body": "hi",
        "timestamp": 0
    }"#;
    let msg = JsonMessageFormatter.deserialize(json.as_bytes()).unwrap();
    assert!(!msg.is_debug);
}
