// Model serialization tests (JSON, lowercase enums, transparent image ids)

use update_agent::models::*;

#[test]
fn test_container_state_from_docker() {
    assert_eq!(ContainerState::from_docker("running"), ContainerState::Running);
    assert_eq!(ContainerState::from_docker("Exited"), ContainerState::Exited);
    assert_eq!(ContainerState::from_docker("removing"), ContainerState::Unknown);
    assert!(ContainerState::Running.is_running());
    assert!(!ContainerState::Restarting.is_running());
}

#[test]
fn test_container_state_serializes_lowercase() {
    let json = serde_json::to_string(&ContainerState::Running).unwrap();
    assert_eq!(json, "\"running\"");
    let back: ContainerState = serde_json::from_str("\"oom\"").unwrap();
    assert_eq!(back, ContainerState::Unknown);
}

#[test]
fn test_image_version_is_transparent() {
    let v = ImageVersion::new("sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08");
    let json = serde_json::to_string(&v).unwrap();
    assert!(json.starts_with("\"sha256:"));
    assert_eq!(v.short(), "9f86d081884c");
    assert_eq!(ImageVersion::from("abc").short(), "abc");
}

#[test]
fn test_image_version_short_respects_char_boundaries() {
    let v = ImageVersion::new("sha256:äöüäöüäöüäöüäöü");
    assert_eq!(v.short(), "äöüäöüäöüäöü");
}

#[test]
fn test_service_spec_defaults_and_policy() {
    let spec: ServiceSpec =
        serde_json::from_str(r#"{"name":"web","image":"registry.example.com/web:latest"}"#).unwrap();
    assert_eq!(spec.update_policy, UpdatePolicy::Auto);
    assert!(spec.rollback_enabled);
    assert!(spec.is_auto());

    let manual: ServiceSpec = serde_json::from_str(
        r#"{"name":"db","image":"db:16","update_policy":"manual","rollback_enabled":false}"#,
    )
    .unwrap();
    assert!(!manual.is_auto());
    assert!(!manual.rollback_enabled);
}

#[test]
fn test_container_config_json_roundtrip() {
    let mut config = ContainerConfig {
        env: vec!["MODE=prod".into()],
        network_mode: Some("host".into()),
        restart_policy: Some(RestartPolicy {
            name: "always".into(),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };
    config.port_bindings.insert(
        "443/tcp".into(),
        vec![PortBinding {
            host_ip: Some("0.0.0.0".into()),
            host_port: Some("8443".into()),
        }],
    );
    let json = serde_json::to_string(&config).unwrap();
    let back: ContainerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}
