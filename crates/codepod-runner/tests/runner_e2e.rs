//! End-to-end control-loop tests against the mock engine and a stub server

use codepod_engine::{ContainerEngine, MockEngine};
use codepod_runner::config::{AgentConfig, DockerConfig, RunnerConfig, ServerConfig};
use codepod_runner::{Config, Job, Runner, SANDBOX_LABEL};
use std::collections::HashMap;
use std::sync::Arc;

fn test_config(server_url: &str) -> Config {
    Config {
        server: ServerConfig {
            url: server_url.to_string(),
            token: String::new(),
        },
        docker: DockerConfig {
            host: "mock".to_string(),
            network: "bridge".to_string(),
        },
        runner: RunnerConfig {
            id: "runner-1".to_string(),
            host: "localhost".to_string(),
            max_jobs: 10,
        },
        agent: AgentConfig::default(),
    }
}

fn create_job(id: &str, sandbox_id: &str) -> Job {
    Job {
        id: id.to_string(),
        job_type: "create".to_string(),
        sandbox_id: sandbox_id.to_string(),
        image: "alpine:3.19".to_string(),
        env: HashMap::new(),
        memory: String::new(),
        cpu: 0,
        network_mode: String::new(),
        token: String::new(),
    }
}

#[tokio::test]
async fn boot_and_poll_creates_and_reports() {
    let mut server = mockito::Server::new_async().await;

    let poll = server
        .mock("GET", "/api/v1/jobs")
        .match_header("x-runner-id", "runner-1")
        .with_status(200)
        .with_body(
            r#"{"jobs":[{"id":"j1","type":"create","sandboxId":"s1","image":"alpine:3.19"}]}"#,
        )
        .expect(1)
        .create_async()
        .await;

    let accept = server
        .mock("POST", "/api/v1/jobs/j1/accept")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let _ca = server
        .mock("GET", "/api/v1/ssh-ca/public-key")
        .with_status(200)
        .with_body("ssh-ed25519 AAAAC3Nza codepod-ca")
        .create_async()
        .await;

    let status_creating = server
        .mock("POST", "/api/v1/sandboxes/s1/runner-status")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "status": "creating"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let status_starting = server
        .mock("POST", "/api/v1/sandboxes/s1/runner-status")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "status": "starting"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let status_running = server
        .mock("POST", "/api/v1/sandboxes/s1/runner-status")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "status": "running",
            "host": "localhost"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let complete = server
        .mock("POST", "/api/v1/jobs/j1/complete")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "success": true
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let engine = Arc::new(MockEngine::new());
    let runner = Runner::with_parts(test_config(&server.url()), engine.clone()).unwrap();

    runner.poll_once().await;

    poll.assert_async().await;
    accept.assert_async().await;
    status_creating.assert_async().await;
    status_starting.assert_async().await;
    status_running.assert_async().await;
    complete.assert_async().await;

    // Exactly one labelled container, running
    assert_eq!(engine.container_count().await, 1);
    let containers = engine
        .list_containers(false)
        .await
        .expect("list running containers");
    assert_eq!(containers.len(), 1);
    assert_eq!(
        containers[0].labels.get(SANDBOX_LABEL),
        Some(&"s1".to_string())
    );

    // The agent env vars ride along on the container config
    let container = engine.get_container(&containers[0].id).await.unwrap();
    assert!(container
        .config
        .env
        .iter()
        .any(|e| e == "AGENT_SANDBOX_ID=s1"));
    assert!(container
        .config
        .env
        .iter()
        .any(|e| e.starts_with("AGENT_TOKEN=")));
    assert!(container
        .config
        .env
        .iter()
        .any(|e| e.starts_with("AGENT_TRUSTED_USER_CA_KEYS=")));
}

#[tokio::test]
async fn duplicate_create_reuses_running_sandbox() {
    let mut server = mockito::Server::new_async().await;

    let _accept = server
        .mock("POST", "/api/v1/jobs/j1/accept")
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let _ca = server
        .mock("GET", "/api/v1/ssh-ca/public-key")
        .with_status(404)
        .create_async()
        .await;

    let _status = server
        .mock("POST", "/api/v1/sandboxes/s1/runner-status")
        .with_status(200)
        .expect_at_least(3)
        .create_async()
        .await;

    let complete = server
        .mock("POST", "/api/v1/jobs/j1/complete")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "success": true
        })))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let engine = Arc::new(MockEngine::new());
    let runner = Runner::with_parts(test_config(&server.url()), engine.clone()).unwrap();

    let job = create_job("j1", "s1");
    runner.handle_job(&job).await.unwrap();
    assert_eq!(engine.container_count().await, 1);
    let first = engine.list_containers(false).await.unwrap()[0].id.clone();

    // Re-delivery of the same job must not create a second container
    runner.handle_job(&job).await.unwrap();
    assert_eq!(engine.container_count().await, 1);
    let second = engine.list_containers(false).await.unwrap()[0].id.clone();
    assert_eq!(first, second);

    complete.assert_async().await;
}

#[tokio::test]
async fn duplicate_create_restarts_stopped_sandbox() {
    let mut server = mockito::Server::new_async().await;

    let _accept = server
        .mock("POST", "/api/v1/jobs/j1/accept")
        .with_status(200)
        .create_async()
        .await;
    let _ca = server
        .mock("GET", "/api/v1/ssh-ca/public-key")
        .with_status(404)
        .create_async()
        .await;
    let _status = server
        .mock("POST", "/api/v1/sandboxes/s1/runner-status")
        .with_status(200)
        .create_async()
        .await;
    let _complete = server
        .mock("POST", "/api/v1/jobs/j1/complete")
        .with_status(200)
        .create_async()
        .await;

    let engine = Arc::new(MockEngine::new());
    let runner = Runner::with_parts(test_config(&server.url()), engine.clone()).unwrap();

    let job = create_job("j1", "s1");
    runner.handle_job(&job).await.unwrap();

    // Simulate the container exiting between deliveries
    let id = engine.list_containers(true).await.unwrap()[0].id.clone();
    engine
        .set_container_state(&id, codepod_engine::ContainerState::Exited)
        .await;

    runner.handle_job(&job).await.unwrap();

    // Same container, started again rather than recreated
    assert_eq!(engine.container_count().await, 1);
    assert_eq!(engine.container_status(&id).await.unwrap(), "running");
}

#[tokio::test]
async fn delete_of_unknown_sandbox_is_success() {
    let mut server = mockito::Server::new_async().await;

    let _accept = server
        .mock("POST", "/api/v1/jobs/j2/accept")
        .with_status(200)
        .create_async()
        .await;

    let _status = server
        .mock("POST", "/api/v1/sandboxes/ghost/runner-status")
        .with_status(200)
        .create_async()
        .await;

    let complete = server
        .mock("POST", "/api/v1/jobs/j2/complete")
        .match_body(mockito::Matcher::Json(serde_json::json!({
            "success": true,
            "message": "Sandbox not found (may already be deleted)"
        })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let runner =
        Runner::with_parts(test_config(&server.url()), Arc::new(MockEngine::new())).unwrap();

    let job = Job {
        id: "j2".to_string(),
        job_type: "delete".to_string(),
        sandbox_id: "ghost".to_string(),
        image: String::new(),
        env: HashMap::new(),
        memory: String::new(),
        cpu: 0,
        network_mode: String::new(),
        token: String::new(),
    };

    runner.handle_job(&job).await.unwrap();
    complete.assert_async().await;
}

#[tokio::test]
async fn delete_removes_existing_sandbox() {
    let mut server = mockito::Server::new_async().await;

    let _accept = server
        .mock(
            "POST",
            mockito::Matcher::Regex(r"^/api/v1/jobs/[^/]+/accept$".to_string()),
        )
        .with_status(200)
        .create_async()
        .await;
    let _ca = server
        .mock("GET", "/api/v1/ssh-ca/public-key")
        .with_status(404)
        .create_async()
        .await;
    let _status = server
        .mock(
            "POST",
            mockito::Matcher::Regex(r"^/api/v1/sandboxes/[^/]+/runner-status$".to_string()),
        )
        .with_status(200)
        .create_async()
        .await;
    let _complete = server
        .mock(
            "POST",
            mockito::Matcher::Regex(r"^/api/v1/jobs/[^/]+/complete$".to_string()),
        )
        .with_status(200)
        .create_async()
        .await;

    let engine = Arc::new(MockEngine::new());
    let runner = Runner::with_parts(test_config(&server.url()), engine.clone()).unwrap();

    runner.handle_job(&create_job("j1", "s1")).await.unwrap();
    assert_eq!(engine.container_count().await, 1);

    let delete = Job {
        id: "j2".to_string(),
        job_type: "delete".to_string(),
        sandbox_id: "s1".to_string(),
        image: String::new(),
        env: HashMap::new(),
        memory: String::new(),
        cpu: 0,
        network_mode: String::new(),
        token: String::new(),
    };
    runner.handle_job(&delete).await.unwrap();

    assert_eq!(engine.container_count().await, 0);
}
