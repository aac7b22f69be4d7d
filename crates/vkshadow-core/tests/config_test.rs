//! Tests for configuration parsing and the shadow handle table.

use std::sync::Arc;

use vkshadow_core::{HandleTable, LayerConfig, LayerError};

#[test]
fn test_defaults_when_sections_missing() {
    let config = LayerConfig::parse("").expect("empty config parses");
    assert!(config.recording.track_image_layouts);
    assert!(config.recording.capture_binding_state);
    assert!(!config.recording.invalidate_disturbed_descriptor_sets);
    assert!(config.submission.use_timeline_semaphores);
    assert_eq!(config.submission.semaphore_pool_limit, 64);
    assert_eq!(config.submission.fence_pool_limit, 16);
}

#[test]
fn test_partial_override() {
    let config = LayerConfig::parse(
        r#"
        [recording]
        invalidate_disturbed_descriptor_sets = true

        [submission]
        use_timeline_semaphores = false
        max_reset_backlog_per_submit = 4
        "#,
    )
    .expect("config parses");
    assert!(config.recording.invalidate_disturbed_descriptor_sets);
    assert!(config.recording.track_image_layouts);
    assert!(!config.submission.use_timeline_semaphores);
    assert_eq!(config.submission.max_reset_backlog_per_submit, 4);
    assert_eq!(config.submission.semaphore_pool_limit, 64);
}

#[test]
fn test_invalid_config_is_config_error() {
    match LayerConfig::parse("[recording]\ntrack_image_layouts = \"yes\"") {
        Err(LayerError::Config(_)) => {}
        other => panic!("expected Config error, got {:?}", other),
    }
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let config = LayerConfig::load_or_default("/nonexistent/vkshadow.toml");
    assert!(config.submission.use_timeline_semaphores);
}

#[test]
fn test_handle_table_lookup_and_removal() {
    let table: HandleTable<String> = HandleTable::new("image");
    assert!(table.is_empty());

    table.insert(0x10, Arc::new("first".to_string()));
    let held = table.get(0x10).expect("registered");
    assert_eq!(held.as_str(), "first");

    let removed = table.remove(0x10).expect("still registered");
    assert!(Arc::ptr_eq(&held, &removed));
    assert!(!table.contains(0x10));

    match table.try_get(0x10) {
        Err(LayerError::UnknownHandle { kind, raw }) => {
            assert_eq!(kind, "image");
            assert_eq!(raw, 0x10);
        }
        other => panic!("expected UnknownHandle, got {:?}", other),
    }
}
