//! Scans mixing built-in and scripted commands.

use std::fs;
use std::sync::Arc;

use scan_server::config::{DeviceConfig, ServerConfig};
use scan_server::device::DeviceRegistry;
use scan_server::{ScanCommand, ScanError, ScanServer, ScanState};

fn config_with_scripts(dir: &tempfile::TempDir) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.engine.condition_poll_ms = 5;
    config.scripting.script_paths = vec![dir.path().to_path_buf()];
    config.scripting.max_operations = 10_000;
    config.devices = ["motor", "power", "counter"]
        .iter()
        .map(|name| DeviceConfig {
            name: name.to_string(),
            initial: 0.0,
            settle_ms: 0,
        })
        .collect();
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_script_inside_loop() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("bump.rhai"),
        r#"
        fn work_units() { 2 }

        fn execute() {
            let device = args()[0];
            write(device, read(device) + 1.0);
        }
        "#,
    )
    .unwrap();
    let config = config_with_scripts(&dir);
    let (registry, journal) = DeviceRegistry::simulated(&config.devices);
    let server = ScanServer::from_config(&config, Arc::new(registry));

    let commands = vec![ScanCommand::looping(
        "motor",
        0.0,
        2.0,
        1.0,
        vec![
            ScanCommand::script("Bump", vec!["counter".to_string()]),
            ScanCommand::log(&["counter"]),
        ],
    )];
    let id = server.submit("bump", commands, false).await.unwrap();
    let info = server.wait_until_done(id).await.unwrap();

    assert_eq!(info.state, ScanState::Succeeded, "{:?}", info.error);
    assert_eq!(info.work_total, 9);
    assert_eq!(info.work_done, 9);
    assert_eq!(journal.values_for("counter"), vec![1.0, 2.0, 3.0]);

    let logged: Vec<f64> = server
        .scan_data(id)
        .await
        .unwrap()
        .iter()
        .map(|sample| sample.value)
        .collect();
    assert_eq!(logged, vec![1.0, 2.0, 3.0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failing_script_fails_scan() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("broken_move.rhai"),
        r#"fn execute() { write("nowhere", 1.0); }"#,
    )
    .unwrap();
    let config = config_with_scripts(&dir);
    let (registry, _) = DeviceRegistry::simulated(&config.devices);
    let server = ScanServer::from_config(&config, Arc::new(registry));

    let id = server
        .submit("broken", vec![ScanCommand::script("broken_move", vec![])], false)
        .await
        .unwrap();
    let info = server.wait_until_done(id).await.unwrap();

    assert_eq!(info.state, ScanState::Failed);
    let error = info.error.unwrap();
    assert!(error.starts_with("Script 'broken_move' failed"), "{}", error);
    assert!(error.contains("Unknown device 'nowhere'"), "{}", error);
}

#[tokio::test]
async fn test_missing_script_is_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_with_scripts(&dir);
    let (registry, _) = DeviceRegistry::simulated(&config.devices);
    let server = ScanServer::from_config(&config, Arc::new(registry));

    let err = server
        .submit("missing", vec![ScanCommand::script("absent", vec![])], false)
        .await
        .unwrap_err();

    assert!(matches!(err, ScanError::ScriptLoad { ref name, .. } if name == "absent"));
    assert!(err.is_compile_error());
    assert!(server.scan_infos().await.is_empty());
}
