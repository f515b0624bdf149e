//! Upgrade endpoint against an agent of the same build

mod common;

use common::TestServer;
use reqwest::StatusCode;

#[tokio::test]
async fn test_same_build_is_not_upgradable() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    let id = server.state.hub.registry.list_agent("edge")[0].id;

    let response = reqwest::Client::new()
        .post(server.url(&format!("/api/client/edge/upgrade?agent_id={}", id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let body = response.text().await.unwrap();
    let events: Vec<&str> = body
        .split("\n\n")
        .filter(|event| !event.is_empty())
        .collect();
    assert_eq!(events.len(), 2);
    assert!(events[0].starts_with("data: agent_info: {"));
    assert!(events[0].contains("\"name\":\"edge\""));
    assert_eq!(events[1], "data: error: agent is not upgradable");

    agent.stop().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_requires_instance() {
    let server = TestServer::start().await;
    let agent = server.spawn_agent("edge").await;
    let client = reqwest::Client::new();

    for query in ["", "?agent_id=", "?agent_id=999"] {
        let response = client
            .post(server.url(&format!("/api/client/edge/upgrade{}", query)))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.text().await.unwrap();
        assert!(body.contains("agent not found. make sure agent_id is correct"));
    }

    agent.stop().await;
    server.shutdown().await;
}
