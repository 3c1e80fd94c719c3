//! On-disk history store behavior

use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use chi_agent::history::{HistoryStore, NewMessage, ProvisioningMarker, Role, ToolCallRecord};

fn open(dir: &TempDir) -> HistoryStore {
    HistoryStore::open(&dir.path().join("state").join("history.db"), 2).unwrap()
}

#[test]
fn test_history_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let now = Utc::now();

    let id = {
        let store = open(&dir);
        let conversation = store.get_active_conversation(now).unwrap();
        store
            .append_message(&conversation.id, NewMessage::user("restart bluetooth"), now)
            .unwrap();
        let call = ToolCallRecord {
            tool: "manage_service".to_string(),
            arguments: json!({ "service": "bluetooth", "action": "restart" }),
            result: json!({ "status": "success" }),
            is_error: false,
            duration_ms: 120,
        };
        store
            .append_message(&conversation.id, NewMessage::assistant(None, vec![call]), now)
            .unwrap();
        conversation.id
    };

    let store = open(&dir);
    let messages = store.messages(&id).unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[1].content, None);
    assert_eq!(messages[1].tool_calls[0].arguments["service"], "bluetooth");

    // Still the active conversation after a restart
    assert_eq!(store.get_active_conversation(now + Duration::minutes(5)).unwrap().id, id);
}

#[test]
fn test_session_gap_starts_new_conversation() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let t0 = Utc::now();

    let first = store.get_active_conversation(t0).unwrap();
    store.append_message(&first.id, NewMessage::user("hi"), t0).unwrap();

    let within = store.get_active_conversation(t0 + Duration::minutes(119)).unwrap();
    assert_eq!(within.id, first.id);

    let after = store.get_active_conversation(t0 + Duration::hours(2) + Duration::seconds(1)).unwrap();
    assert_ne!(after.id, first.id);
    assert_eq!(store.list_conversations(30).unwrap().len(), 2);
}

#[test]
fn test_clear_all_keeps_data_records() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let now = Utc::now();

    let conversation = store.get_active_conversation(now).unwrap();
    store.append_message(&conversation.id, NewMessage::user("network?"), now).unwrap();
    store
        .append_data_record(Some(conversation.id.as_str()), "get_network_status", &json!({ "state": "connected" }), now)
        .unwrap();

    assert_eq!(store.clear_all().unwrap(), 1);
    assert!(store.list_conversations(30).unwrap().is_empty());
    assert!(store.get_conversation(&conversation.id).unwrap().is_none());

    let records = store.list_data_records(10).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].data["state"], "connected");

    assert_eq!(store.clear_data_records().unwrap(), 1);
    assert!(store.list_data_records(10).unwrap().is_empty());
}

#[test]
fn test_data_records_newest_first() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir);
    let now = Utc::now();

    for state in ["connecting", "connected", "disconnected"] {
        store
            .append_data_record(None, "get_network_status", &json!({ "state": state }), now)
            .unwrap();
    }

    let records = store.list_data_records(2).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].data["state"], "disconnected");
    assert_eq!(records[1].data["state"], "connected");
    assert!(records[0].conversation_id.is_none());
}

#[test]
fn test_provisioning_marker() {
    let dir = TempDir::new().unwrap();
    let marker = ProvisioningMarker::new(dir.path().join("provisioned"));

    assert!(!marker.is_complete());
    marker.mark_complete("qwen3:8b").unwrap();
    assert!(marker.is_complete());
    assert_eq!(marker.read().unwrap().model, "qwen3:8b");
}
