// Optional DockerRuntime tests when Docker daemon is available

use update_agent::runtime::{ContainerRuntime, DockerRuntime};

async fn daemon() -> Option<DockerRuntime> {
    let runtime = DockerRuntime::connect().ok()?;
    // Skip when Docker is not available (e.g. CI without Docker)
    runtime.ping().await.ok()?;
    Some(runtime)
}

#[tokio::test]
async fn docker_runtime_reports_missing_container() {
    let Some(runtime) = daemon().await else {
        return;
    };
    let err = runtime
        .inspect("update-agent-test-no-such-container")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn docker_runtime_remove_missing_is_not_found() {
    let Some(runtime) = daemon().await else {
        return;
    };
    let err = runtime
        .remove("update-agent-test-no-such-container")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
