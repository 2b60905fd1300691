//! Plugin discovery across compiled-in, legacy and directory sources.

mod common;

use relay_core::managers::{AgentRegistry, PluginLoader};
use relay_shared::{Agent, AgentContext, AgentRequest};
use std::sync::Arc;
use std::time::Duration;

const VALID: &str = r#"
[[agents]]
name = "waitlist"
description = "Waitlist handling"
capabilities = ["waitlist"]
command = "sh"
args = ["-c", "cat > /dev/null"]
"#;

const BROKEN: &str = r#"
[[agents]]
name = "broken"
# missing command
"#;

fn plugin_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        std::fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

#[tokio::test]
async fn test_broken_file_is_skipped_not_raised() {
    let dir = plugin_dir(&[("ops.toml", VALID), ("broken.toml", BROKEN), ("notes.txt", "ignored")]);
    let loader = PluginLoader::new(Some(dir.path().to_path_buf()), Duration::from_secs(1));

    let count = loader.discover().await;
    assert_eq!(count, 1);
    assert_eq!(loader.discovered_names().await, vec!["waitlist".to_string()]);
    assert_eq!(loader.source_kind("waitlist").await, Some("directory"));
    assert!(loader.source_kind("broken").await.is_none());
}

#[tokio::test]
async fn test_missing_plugin_dir_is_tolerated() {
    let loader = PluginLoader::new(Some("/nonexistent/relay/plugins".into()), Duration::from_secs(1));
    assert_eq!(loader.discover().await, 0);
}

#[tokio::test]
async fn test_builtins_are_discovered() {
    let mut loader = PluginLoader::new(None, Duration::from_secs(1));
    loader.register_builtins();
    loader.discover().await;

    assert_eq!(loader.source_kind("echo").await, Some("native"));
    assert_eq!(loader.source_kind("greeter").await, Some("legacy"));
}

#[tokio::test]
async fn test_directory_entry_overrides_builtin() {
    let dir = plugin_dir(&[(
        "override.toml",
        "[[agents]]\nname = \"echo\"\ncommand = \"sh\"\n",
    )]);
    let mut loader = PluginLoader::new(Some(dir.path().to_path_buf()), Duration::from_secs(1));
    loader.register_builtins();
    loader.discover().await;

    assert_eq!(loader.source_kind("echo").await, Some("directory"));
}

#[tokio::test]
async fn test_load_caches_one_instance() {
    let mut loader = PluginLoader::new(None, Duration::from_secs(1));
    loader.register_builtins();
    loader.discover().await;

    let a = loader.load("echo").await.unwrap();
    let b = loader.load("echo").await.unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(loader.loaded_names().await, vec!["echo".to_string()]);

    let fresh = loader.reload("echo").await.unwrap();
    assert!(!Arc::ptr_eq(&a, &fresh));

    assert!(loader.unload("echo").await);
    assert!(loader.loaded_names().await.is_empty());
    assert!(!loader.discovered_names().await.contains(&"echo".to_string()));
}

#[tokio::test]
async fn test_unknown_name_rediscovers_before_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let loader = PluginLoader::new(Some(dir.path().to_path_buf()), Duration::from_secs(1));
    assert_eq!(loader.discover().await, 0);

    // Dropped in after the initial scan
    std::fs::write(dir.path().join("late.toml"), VALID).unwrap();
    assert!(loader.load("waitlist").await.is_ok());

    let err = loader.load("ghost").await.err().unwrap();
    assert!(err.is_not_found());
    loader.shutdown_all().await;
}

#[tokio::test]
async fn test_legacy_agent_dispatches_through_adapter() {
    let mut loader = PluginLoader::new(None, Duration::from_secs(1));
    loader.register_builtins();
    let registry = AgentRegistry::with_loader(Arc::new(loader));
    registry.loader().unwrap().discover().await;

    let registered = registry.register_discovered().await;
    assert!(registered >= 2);

    let meta = registry.get_metadata("greeter").await.unwrap();
    assert!(meta.tags.contains(&"legacy".to_string()));

    let req = AgentRequest::new("hello").with_context(serde_json::json!({"business_name": "Studio 9"}));
    let resp = registry.execute("greeter", &req, &AgentContext::new()).await.unwrap();
    assert!(resp.success);
    assert!(resp.message.contains("Studio 9"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_reload_picks_up_rewritten_descriptor() {
    let dir = plugin_dir(&[("ops.toml", VALID)]);
    let loader = PluginLoader::new(Some(dir.path().to_path_buf()), Duration::from_secs(5));
    loader.discover().await;

    let before = loader.load("waitlist").await.unwrap();
    assert_eq!(before.metadata().description, "Waitlist handling");
    let old_bridge = loader.bridge("waitlist").await.unwrap();
    assert!(old_bridge.health_check().await.unwrap());
    assert!(old_bridge.is_running().await);

    std::fs::write(
        dir.path().join("ops.toml"),
        r#"
[[agents]]
name = "waitlist"
description = "Waitlist with SMS follow-up"
capabilities = ["waitlist", "sms"]
command = "sh"
args = ["-c", "cat > /dev/null"]
"#,
    )
    .unwrap();

    let after = loader.reload("waitlist").await.unwrap();
    let meta = after.metadata();
    assert_eq!(meta.description, "Waitlist with SMS follow-up");
    assert!(meta.capabilities.contains("sms"));
    assert!(!Arc::ptr_eq(&before, &after));

    // The previous subprocess is gone
    assert!(!old_bridge.is_running().await);
    let new_bridge = loader.bridge("waitlist").await.unwrap();
    assert!(!Arc::ptr_eq(&old_bridge, &new_bridge));
    loader.shutdown_all().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_health_check_all_spawns_directory_agents() {
    let dir = plugin_dir(&[("ops.toml", VALID)]);
    let loader = PluginLoader::new(Some(dir.path().to_path_buf()), Duration::from_secs(5));
    loader.discover().await;

    let report = loader.health_check_all().await;
    assert_eq!(report.get("waitlist"), Some(&true));
    loader.shutdown_all().await;
}
