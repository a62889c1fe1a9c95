//! End-to-end router behavior against scripted in-memory servers.

mod common;

use common::{config, eventually, id, local, FakeConnector, FakeServer};
use op_mcp_router::prelude::*;
use op_mcp_router::protocol::codes;
use op_mcp_router::session::SessionStream;
use op_mcp_router::{ApplyOutcome, ClientSession, DefaultConnector, ReconnectPolicy, ServerStatusReport};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::StreamExt;

fn router_with(fake: &Arc<FakeConnector>, config: RouterConfig) -> Arc<Router> {
    Router::with_connector(&config, fake.clone())
}

async fn rpc(router: &Router, session: &ClientSession, method: &str, params: Value) -> Value {
    router
        .handle_message(session, json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params}))
        .await
        .expect("requests always get a response")
}

fn text(response: &Value) -> &str {
    response["result"]["content"][0]["text"].as_str().unwrap_or_default()
}

fn exposed_tools(response: &Value) -> Vec<String> {
    response["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap().to_string())
        .collect()
}

/// Collect notifications with `method` until `count` arrive or the stream
/// goes quiet.
async fn collect(stream: &mut SessionStream, method: &str, count: usize) -> Vec<Value> {
    let mut found = Vec::new();
    while found.len() < count {
        match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
            Ok(Some(message)) if message["method"] == method => found.push(message),
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
    found
}

/// Discard whatever is already queued, such as catalog announcements from
/// servers registered before the session opened.
async fn drain(stream: &mut SessionStream) {
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(100), stream.next()).await {}
}

async fn dev_router() -> (Arc<FakeConnector>, Arc<Router>) {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file", "write_file", "notify", "slow", "progress", "fail"]));
    fake.add("git", FakeServer::tools(&["commit", "status"]).with_prompts(&["summarize"]));

    let mut cfg = config();
    cfg.profiles.insert(
        "dev".into(),
        ProfileConfig::new("development").with_servers([id("fs"), id("git")]),
    );
    cfg.profiles
        .insert("ops".into(), ProfileConfig::new("operations").with_servers([id("git")]));

    let router = router_with(&fake, cfg);
    router.register_server(local("fs")).await.unwrap();
    router.register_server(local("git")).await.unwrap();
    (fake, router)
}

#[tokio::test]
async fn test_dev_profile_routes_by_namespace_and_alias() {
    let (_fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(Some("dev")).unwrap();

    let listed = rpc(&router, &session, "tools/list", json!({})).await;
    let tools = exposed_tools(&listed);
    // Listing pages through the server's cursor
    assert_eq!(tools.len(), 8);
    assert!(tools.contains(&"commit".to_string()));

    let response = rpc(&router, &session, "tools/call", json!({"name": "git_t_commit", "arguments": {}})).await;
    assert_eq!(text(&response), "git:commit");

    let response = rpc(&router, &session, "tools/call", json!({"name": "read_file", "arguments": {"path": "/a"}})).await;
    assert_eq!(text(&response), "fs:read_file");
    assert_eq!(response["result"]["arguments"]["path"], "/a");

    let response = rpc(&router, &session, "prompts/get", json!({"name": "git_p_summarize"})).await;
    assert_eq!(response["result"]["messages"][0]["content"]["text"], "git:summarize");

    router.shutdown().await;
}

#[tokio::test]
async fn test_profile_hides_out_of_scope_servers() {
    let (_fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(Some("ops")).unwrap();

    let listed = rpc(&router, &session, "tools/list", json!({})).await;
    assert_eq!(exposed_tools(&listed), vec!["commit", "status"]);

    for name in ["fs_t_read_file", "read_file", "nobody_t_nothing"] {
        let response = rpc(&router, &session, "tools/call", json!({"name": name})).await;
        assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE, "{}", name);
    }

    router.shutdown().await;
}

#[tokio::test]
async fn test_default_mode_namespaces_later_duplicates() {
    let fake = FakeConnector::new();
    fake.add("alpha", FakeServer::tools(&["search"]));
    fake.add("beta", FakeServer::tools(&["search"]));
    let router = router_with(&fake, config());
    router.register_server(local("alpha")).await.unwrap();
    router.register_server(local("beta")).await.unwrap();

    let (session, _stream) = router.open_session(None).unwrap();
    let listed = rpc(&router, &session, "tools/list", json!({})).await;
    assert_eq!(exposed_tools(&listed), vec!["search", "beta_t_search"]);

    let response = rpc(&router, &session, "tools/call", json!({"name": "search"})).await;
    assert_eq!(text(&response), "alpha:search");
    let response = rpc(&router, &session, "tools/call", json!({"name": "beta_t_search"})).await;
    assert_eq!(text(&response), "beta:search");
    let response = rpc(&router, &session, "tools/call", json!({"name": "alpha_t_search"})).await;
    assert_eq!(text(&response), "alpha:search");

    router.shutdown().await;
}

#[tokio::test]
async fn test_strict_mode_rejects_conflicting_server() {
    let fake = FakeConnector::new();
    fake.add("alpha", FakeServer::tools(&["search"]));
    fake.add("beta", FakeServer::tools(&["fetch", "search"]));
    let mut cfg = config();
    cfg.strict = true;
    let router = router_with(&fake, cfg);

    router.register_server(local("alpha")).await.unwrap();
    let err = router.register_server(local("beta")).await.unwrap_err();
    assert!(matches!(err, RouterError::CapabilityConflict { ref alias, .. } if alias == "search"));

    assert!(router.connection("beta").is_none());
    let servers: Vec<_> = router.list_servers().into_iter().map(|s| s.id.to_string()).collect();
    assert_eq!(servers, vec!["alpha"]);

    let (session, _stream) = router.open_session(None).unwrap();
    let listed = rpc(&router, &session, "tools/list", json!({})).await;
    assert_eq!(exposed_tools(&listed), vec!["search"]);

    router.shutdown().await;
}

#[tokio::test]
async fn test_reconnect_restores_identical_catalog() {
    let (fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(None).unwrap();
    let before = rpc(&router, &session, "tools/list", json!({})).await;
    let fs = router.connection("fs").unwrap();

    for round in 2..=4 {
        fake.kill_link("fs");
        assert!(eventually(|| fake.connects("fs") >= round && fs.status() == ConnectionStatus::Healthy).await);
        let after = rpc(&router, &session, "tools/list", json!({})).await;
        assert_eq!(after["result"], before["result"]);
    }

    router.shutdown().await;
}

#[tokio::test]
async fn test_failed_server_does_not_affect_others() {
    let (fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(None).unwrap();
    let fs = router.connection("fs").unwrap();

    fake.set_failing("fs", true);
    fake.kill_link("fs");
    assert!(eventually(|| !fs.status().is_serving()).await);

    let response = rpc(&router, &session, "tools/call", json!({"name": "git_t_status"})).await;
    assert_eq!(text(&response), "git:status");

    let listed = rpc(&router, &session, "tools/list", json!({})).await;
    assert_eq!(exposed_tools(&listed), vec!["commit", "status"]);

    let response = rpc(&router, &session, "tools/call", json!({"name": "fs_t_read_file"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);

    let report = router.list_servers().into_iter().find(|s| s.id == id("fs")).unwrap();
    assert!(report.last_error.is_some());
    assert_eq!(report.tools, 0);

    fake.set_failing("fs", false);
    assert!(eventually(|| fs.status() == ConnectionStatus::Healthy).await);
    let response = rpc(&router, &session, "tools/call", json!({"name": "fs_t_read_file"})).await;
    assert_eq!(text(&response), "fs:read_file");

    router.shutdown().await;
}

#[tokio::test]
async fn test_unregister_fails_in_flight_calls() {
    let (_fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(None).unwrap();

    let call = {
        let router = router.clone();
        let session = session.clone();
        tokio::spawn(async move {
            router
                .call(&session, CapabilityKind::Tool, "slow", json!({"arguments": {"ms": 10_000}}))
                .await
        })
    };
    assert!(eventually(|| session.pending_count() == 1).await);

    router.unregister_server("fs").await.unwrap();
    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, RouterError::ConnectionTerminated { ref server } if server == "fs"));

    assert!(router.connection("fs").is_none());
    assert!(router.list(&session, CapabilityKind::Tool).iter().all(|e| e.server == id("git")));
    assert!(matches!(
        router.unregister_server("fs").await,
        Err(RouterError::ServerNotFound { .. })
    ));

    router.shutdown().await;
}

fn give_up_after(max_attempts: u32) -> RouterConfig {
    RouterConfig::builder()
        .reconnect(ReconnectPolicy {
            initial_delay_ms: 20,
            max_delay_ms: 100,
            max_attempts: Some(max_attempts),
            ..ReconnectPolicy::default()
        })
        .build()
}

fn report(router: &Router, server: &str) -> ServerStatusReport {
    router
        .list_servers()
        .into_iter()
        .find(|s| s.id == id(server))
        .expect("server is registered")
}

#[tokio::test]
async fn test_partial_discovery_serves_what_was_reported() {
    let fake = FakeConnector::new();
    fake.add(
        "git",
        FakeServer::tools(&["commit"])
            .with_prompts(&["summarize"])
            .with_failing_list("prompts/list"),
    );
    let router = router_with(&fake, config());
    router.register_server(local("git")).await.unwrap();
    let (session, _stream) = router.open_session(None).unwrap();

    let status = report(&router, "git");
    assert_eq!(status.status, ConnectionStatus::Degraded);
    assert_eq!(status.tools, 1);
    assert_eq!(status.prompts, 0);

    let response = rpc(&router, &session, "tools/call", json!({"name": "commit"})).await;
    assert_eq!(text(&response), "git:commit");

    let response = rpc(&router, &session, "prompts/get", json!({"name": "summarize"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);
    let listed = rpc(&router, &session, "prompts/list", json!({})).await;
    assert!(listed["result"]["prompts"].as_array().unwrap().is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_refused_server_gives_up_and_revives_on_request() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file"]));
    fake.set_failing("fs", true);
    let router = router_with(&fake, give_up_after(2));

    assert!(router.register_server(local("fs")).await.is_err());
    assert!(eventually(|| report(&router, "fs").retries_exhausted).await);
    assert_eq!(fake.connects("fs"), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.connects("fs"), 2);
    assert!(router.connection("fs").is_some());
    assert!(report(&router, "fs").last_error.is_some());

    fake.set_failing("fs", false);
    router.reconnect_server("fs").unwrap();
    let fs = router.connection("fs").unwrap();
    assert!(eventually(|| fs.status() == ConnectionStatus::Healthy).await);
    assert!(!report(&router, "fs").retries_exhausted);

    let (session, _stream) = router.open_session(None).unwrap();
    let response = rpc(&router, &session, "tools/call", json!({"name": "read_file"})).await;
    assert_eq!(text(&response), "fs:read_file");

    router.shutdown().await;
}

#[tokio::test]
async fn test_flapping_link_counts_toward_retry_budget() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file"]));
    fake.add("git", FakeServer::tools(&["status"]));
    fake.set_lifetime("fs", Some(Duration::from_millis(80)));
    let router = router_with(&fake, give_up_after(3));
    router.register_server(local("fs")).await.unwrap();
    router.register_server(local("git")).await.unwrap();

    // Every link is accepted and then dropped, so only the budget stops it.
    assert!(eventually(|| report(&router, "fs").retries_exhausted).await);
    let status = report(&router, "fs");
    assert_eq!(status.reconnect_attempts, 3);
    assert!(!status.status.is_serving());
    assert_eq!(fake.connects("fs"), 3);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(fake.connects("fs"), 3);
    assert_eq!(report(&router, "git").status, ConnectionStatus::Healthy);

    fake.set_lifetime("fs", None);
    router.reconnect_server("fs").unwrap();
    let fs = router.connection("fs").unwrap();
    assert!(eventually(|| fs.status() == ConnectionStatus::Healthy).await);
    assert_eq!(report(&router, "fs").reconnect_attempts, 0);

    router.shutdown().await;
}

#[tokio::test]
async fn test_terminated_server_leaves_other_calls_untouched() {
    let fake = FakeConnector::new();
    fake.add("s1", FakeServer::tools(&["read_file"]));
    fake.add("s2", FakeServer::tools(&["slow"]));
    let router = router_with(&fake, config());
    router.register_server(local("s1")).await.unwrap();
    router.register_server(local("s2")).await.unwrap();
    let (session, _stream) = router.open_session(None).unwrap();

    let call = {
        let router = router.clone();
        let session = session.clone();
        tokio::spawn(async move {
            router
                .call(&session, CapabilityKind::Tool, "s2_t_slow", json!({"arguments": {"ms": 300}}))
                .await
        })
    };
    assert!(eventually(|| session.pending_count() == 1).await);

    router.unregister_server("s1").await.unwrap();
    let result = call.await.unwrap().unwrap();
    assert_eq!(result["content"][0]["text"], "s2:slow");
    assert_eq!(report(&router, "s2").status, ConnectionStatus::Healthy);

    router.shutdown().await;
}

#[tokio::test]
async fn test_call_timeout_leaves_connection_usable() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["slow", "read_file"]));
    let cfg = RouterConfig {
        call_timeout_secs: 1,
        ..config()
    };
    let router = router_with(&fake, cfg);
    router.register_server(local("fs")).await.unwrap();
    let (session, _stream) = router.open_session(None).unwrap();

    let response = rpc(&router, &session, "tools/call", json!({"name": "slow", "arguments": {"ms": 3000}})).await;
    assert_eq!(response["error"]["code"], codes::TIMEOUT);
    assert_eq!(session.pending_count(), 0);

    let response = rpc(&router, &session, "tools/call", json!({"name": "read_file"})).await;
    assert_eq!(text(&response), "fs:read_file");
    assert!(router.connection("fs").unwrap().status().is_serving());

    router.shutdown().await;
}

#[tokio::test]
async fn test_downstream_error_keeps_code_and_names_capability() {
    let (_fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(None).unwrap();

    let response = rpc(&router, &session, "tools/call", json!({"name": "fail"})).await;
    assert_eq!(response["error"]["code"], -32602);
    assert_eq!(response["error"]["message"], "bad arguments");
    assert_eq!(response["error"]["data"]["server"], "fs");
    assert_eq!(response["error"]["data"]["capability"], "fs_t_fail");

    router.shutdown().await;
}

#[tokio::test]
async fn test_progress_from_shared_local_server_reaches_only_the_caller() {
    let (_fake, router) = dev_router().await;
    assert_eq!(router.list_servers()[0].transport, op_mcp_router::TransportKind::Local);

    let (a, mut stream_a) = router.open_session(None).unwrap();
    let (b, mut stream_b) = router.open_session(Some("dev")).unwrap();
    let (_c, mut stream_c) = router.open_session(None).unwrap();

    // Both clients pick the same progress token
    let call = |session: Arc<ClientSession>, label: &'static str| {
        let router = router.clone();
        async move {
            let params = json!({"name": "progress", "arguments": {"label": label}, "_meta": {"progressToken": 7}});
            rpc(&router, &session, "tools/call", params).await
        }
    };
    let (ra, rb) = tokio::join!(call(a.clone(), "a"), call(b.clone(), "b"));
    assert_eq!(text(&ra), "fs:progress");
    assert_eq!(text(&rb), "fs:progress");

    for (stream, label) in [(&mut stream_a, "a"), (&mut stream_b, "b")] {
        let progress = collect(stream, "notifications/progress", 4).await;
        assert_eq!(progress.len(), 2, "session {} got {:?}", label, progress);
        for message in progress {
            assert_eq!(message["params"]["progressToken"], 7);
            assert_eq!(message["params"]["message"], label);
            assert_eq!(message["params"]["_meta"]["server"], "fs");
        }
    }
    assert!(collect(&mut stream_c, "notifications/progress", 1).await.is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_notifications_respect_profile_scope() {
    let (_fake, router) = dev_router().await;
    let (caller, mut in_scope) = router.open_session(Some("dev")).unwrap();
    let (_ops, mut out_of_scope) = router.open_session(Some("ops")).unwrap();
    let (_all, mut unrestricted) = router.open_session(None).unwrap();

    let response = rpc(&router, &caller, "tools/call", json!({"name": "notify", "arguments": {"text": "hello"}})).await;
    assert_eq!(text(&response), "fs:notify");

    for stream in [&mut in_scope, &mut unrestricted] {
        let messages = collect(stream, "notifications/message", 1).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["params"]["data"], "hello");
        assert_eq!(messages[0]["params"]["_meta"]["server"], "fs");
    }
    assert!(collect(&mut out_of_scope, "notifications/message", 1).await.is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_list_changed_triggers_rediscovery_and_notification() {
    let (fake, router) = dev_router().await;
    let (session, mut stream) = router.open_session(Some("dev")).unwrap();
    let (_ops, mut ops_stream) = router.open_session(Some("ops")).unwrap();
    drain(&mut stream).await;
    drain(&mut ops_stream).await;

    fake.set_tools("fs", &["read_file", "grep"]);
    assert!(
        eventually(|| router
            .list(&session, CapabilityKind::Tool)
            .iter()
            .any(|e| e.original_id == "grep"))
        .await
    );
    assert_eq!(collect(&mut stream, "notifications/tools/list_changed", 1).await.len(), 1);
    assert!(collect(&mut ops_stream, "notifications/tools/list_changed", 1).await.is_empty());

    let response = rpc(&router, &session, "tools/call", json!({"name": "write_file"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);

    router.shutdown().await;
}

#[tokio::test]
async fn test_resources_by_uri_and_template() {
    let fake = FakeConnector::new();
    fake.add(
        "fs",
        FakeServer::default()
            .with_resources(&["file:///readme"])
            .with_templates(&["file:///docs/{name}"]),
    );
    let router = router_with(&fake, config());
    router.register_server(local("fs")).await.unwrap();
    let (session, _stream) = router.open_session(None).unwrap();

    let listed = rpc(&router, &session, "resources/list", json!({})).await;
    assert_eq!(listed["result"]["resources"][0]["uri"], "file:///readme");
    let listed = rpc(&router, &session, "resources/templates/list", json!({})).await;
    assert_eq!(listed["result"]["resourceTemplates"][0]["uriTemplate"], "file:///docs/{name}");

    for uri in ["fs:file:///readme", "file:///readme", "fs:file:///docs/intro"] {
        let response = rpc(&router, &session, "resources/read", json!({"uri": uri})).await;
        assert_eq!(response["result"]["contents"][0]["text"], "fs contents", "{}", uri);
    }
    let response = rpc(&router, &session, "resources/read", json!({"uri": "fs:file:///secret"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);

    router.shutdown().await;
}

#[tokio::test]
async fn test_completion_routes_to_prompt_owner() {
    let (_fake, router) = dev_router().await;
    let (session, _stream) = router.open_session(None).unwrap();

    let params = json!({"ref": {"type": "ref/prompt", "name": "git_p_summarize"}, "argument": {"name": "x", "value": ""}});
    let response = rpc(&router, &session, "completion/complete", params).await;
    assert_eq!(response["result"]["completion"]["values"][0], "git-completion");
    assert_eq!(response["result"]["completion"]["ref"]["name"], "summarize");

    router.shutdown().await;
}

#[tokio::test]
async fn test_admin_reports_and_forced_reconnect() {
    let (fake, router) = dev_router().await;

    let servers = router.list_servers();
    assert_eq!(servers.len(), 2);
    let fs = servers.iter().find(|s| s.id == id("fs")).unwrap();
    assert_eq!(fs.status, ConnectionStatus::Healthy);
    assert_eq!(fs.tools, 6);
    assert!(fs.connected_since.is_some());

    let profiles = router.list_profiles();
    let dev = profiles.iter().find(|p| p.name == "dev").unwrap();
    assert_eq!((dev.servers.len(), dev.registered), (2, 2));

    router.reconnect_server("git").unwrap();
    assert!(eventually(|| fake.connects("git") == 2).await);
    assert!(matches!(router.reconnect_server("nope"), Err(RouterError::ServerNotFound { .. })));

    router.unregister_server("git").await.unwrap();
    let dev = router.list_profiles().into_iter().find(|p| p.name == "dev").unwrap();
    assert_eq!((dev.servers.len(), dev.registered), (2, 1));

    router.shutdown().await;
}

#[tokio::test]
async fn test_unknown_profile_is_rejected() {
    let (_fake, router) = dev_router().await;
    assert!(matches!(
        router.open_session(Some("missing")),
        Err(RouterError::ProfileNotFound { ref name }) if name == "missing"
    ));

    let (_client, server_side) = tokio::io::duplex(1024);
    let (reader, writer) = tokio::io::split(server_side);
    let err = op_mcp_router::serve_connection(router.clone(), Some("missing"), reader, writer)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("missing"));

    router.shutdown().await;
}

#[tokio::test]
async fn test_deleted_profile_revokes_access() {
    let (_fake, router) = dev_router().await;
    let (session, mut stream) = router.open_session(Some("ops")).unwrap();
    drain(&mut stream).await;

    assert!(router.remove_profile("ops"));
    assert_eq!(collect(&mut stream, "notifications/tools/list_changed", 1).await.len(), 1);

    let response = rpc(&router, &session, "tools/call", json!({"name": "git_t_commit"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);
    assert!(router.list(&session, CapabilityKind::Tool).is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_profile_server_edits_notify_bound_sessions() {
    let (_fake, router) = dev_router().await;
    let (session, mut stream) = router.open_session(Some("ops")).unwrap();
    let (_other, mut other_stream) = router.open_session(Some("dev")).unwrap();
    drain(&mut stream).await;
    drain(&mut other_stream).await;

    let response = rpc(&router, &session, "tools/call", json!({"name": "fs_t_read_file"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);

    assert!(router.add_profile_server("ops", id("fs")).unwrap());
    assert_eq!(collect(&mut stream, "notifications/tools/list_changed", 1).await.len(), 1);
    let response = rpc(&router, &session, "tools/call", json!({"name": "fs_t_read_file"})).await;
    assert_eq!(text(&response), "fs:read_file");

    // No change, no notification.
    assert!(!router.add_profile_server("ops", id("fs")).unwrap());
    assert!(collect(&mut stream, "notifications/tools/list_changed", 1).await.is_empty());

    assert!(router.remove_profile_server("ops", "fs").unwrap());
    assert_eq!(collect(&mut stream, "notifications/tools/list_changed", 1).await.len(), 1);
    let response = rpc(&router, &session, "tools/call", json!({"name": "fs_t_read_file"})).await;
    assert_eq!(response["error"]["code"], codes::CAPABILITY_UNAVAILABLE);

    assert!(collect(&mut other_stream, "notifications/tools/list_changed", 1).await.is_empty());
    assert!(matches!(
        router.add_profile_server("missing", id("fs")),
        Err(RouterError::ProfileNotFound { .. })
    ));

    router.shutdown().await;
}

#[tokio::test]
async fn test_client_hangup_cancels_downstream_work() {
    let (fake, router) = dev_router().await;
    let (client, server_side) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(server_side);
    let serving = tokio::spawn(op_mcp_router::serve_connection(router.clone(), Some("dev"), reader, writer));

    let (_client_read, mut client_write) = tokio::io::split(client);
    let request = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "tools/call",
        "params": {"name": "slow", "arguments": {"ms": 3000}}
    });
    let mut line = serde_json::to_vec(&request).unwrap();
    line.push(b'\n');
    client_write.write_all(&line).await.unwrap();
    assert!(eventually(|| router.sessions().snapshot().iter().any(|s| s.pending_count() == 1)).await);

    client_write.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), serving)
        .await
        .expect("session ends without waiting for the slow call")
        .unwrap()
        .unwrap();
    assert!(router.sessions().is_empty());

    assert!(eventually(|| fake.received("fs", "notifications/cancelled").len() == 1).await);
    let cancelled = fake.received("fs", "notifications/cancelled").remove(0);
    assert_eq!(cancelled["params"]["reason"], "client disconnected");

    router.shutdown().await;
}

#[tokio::test]
async fn test_serve_connection_over_stream() {
    let (_fake, router) = dev_router().await;
    let (client, server_side) = tokio::io::duplex(1 << 16);
    let (reader, writer) = tokio::io::split(server_side);
    let serving = tokio::spawn(op_mcp_router::serve_connection(router.clone(), Some("dev"), reader, writer));

    let (client_read, mut client_write) = tokio::io::split(client);
    let requests = [
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {"protocolVersion": "2024-11-05"}}),
        json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        json!({"jsonrpc": "2.0", "id": "three", "method": "tools/call", "params": {"name": "git_t_commit"}}),
    ];
    for request in &requests {
        let mut line = serde_json::to_vec(request).unwrap();
        line.push(b'\n');
        client_write.write_all(&line).await.unwrap();
    }
    client_write.write_all(b"{not json\n").await.unwrap();

    let mut lines = BufReader::new(client_read).lines();
    let mut responses = Vec::new();
    while responses.len() < 4 {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let message: Value = serde_json::from_str(&line).unwrap();
        if message.get("id").is_some() {
            responses.push(message);
        }
    }

    let by_id = |id: Value| responses.iter().find(|r| r["id"] == id).cloned().unwrap();
    assert_eq!(by_id(json!(1))["result"]["serverInfo"]["name"], "op-mcp-router");
    assert_eq!(by_id(json!(2))["result"]["tools"].as_array().unwrap().len(), 8);
    assert_eq!(text(&by_id(json!("three"))), "git:commit");
    assert_eq!(by_id(Value::Null)["error"]["code"], codes::PARSE_ERROR);

    client_write.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(router.sessions().is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_watcher_changes_are_idempotent() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file"]));
    let router = router_with(&fake, config());
    let watcher = ConfigWatcher::new(router.clone());

    let upsert = ConfigChange::UpsertServer(local("fs"));
    assert_eq!(watcher.apply(upsert.clone()).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(watcher.apply(upsert).await.unwrap(), ApplyOutcome::Unchanged);
    assert_eq!(fake.connects("fs"), 1);

    let profile = ConfigChange::UpsertProfile {
        name: "dev".into(),
        profile: ProfileConfig::new("").with_servers([id("fs")]),
    };
    assert_eq!(watcher.apply(profile.clone()).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(watcher.apply(profile).await.unwrap(), ApplyOutcome::Unchanged);

    // A changed definition replaces the connection
    let changed = ConfigChange::UpsertServer(local("fs").with_env("DEBUG", "1"));
    assert_eq!(watcher.apply(changed).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(fake.connects("fs"), 2);

    let remove = ConfigChange::RemoveServer(id("fs"));
    assert_eq!(watcher.apply(remove.clone()).await.unwrap(), ApplyOutcome::Applied);
    assert_eq!(watcher.apply(remove).await.unwrap(), ApplyOutcome::Unchanged);
    assert_eq!(
        watcher.apply(ConfigChange::RemoveProfile("dev".into())).await.unwrap(),
        ApplyOutcome::Applied
    );

    router.shutdown().await;
}

#[tokio::test]
async fn test_watcher_snapshot_converges() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file"]));
    fake.add("git", FakeServer::tools(&["commit"]));
    let router = router_with(&fake, config());
    let watcher = ConfigWatcher::new(router.clone());

    let first = RouterConfig::builder()
        .server(local("fs"))
        .server(local("git"))
        .profile("dev", ProfileConfig::new("").with_servers([id("fs"), id("git")]))
        .build();
    assert_eq!(watcher.apply_snapshot(&first).await, 3);
    assert_eq!(watcher.apply_snapshot(&first).await, 0);

    let mut disabled = local("fs");
    disabled.enabled = false;
    let second = RouterConfig::builder().server(disabled).server(local("git")).build();
    assert_eq!(watcher.apply_snapshot(&second).await, 2);
    assert_eq!(router.server_ids().into_iter().collect::<Vec<_>>(), vec![id("git")]);
    assert!(router.profile_names().is_empty());

    router.shutdown().await;
}

#[tokio::test]
async fn test_watch_file_keeps_last_good_config() {
    let fake = FakeConnector::new();
    fake.add("fs", FakeServer::tools(&["read_file"]));
    let router = router_with(&fake, config());
    let watcher = Arc::new(ConfigWatcher::new(router.clone()));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("router.yaml");
    std::fs::write(&path, "servers: []\n").unwrap();

    let task = {
        let watcher = watcher.clone();
        let path = path.clone();
        tokio::spawn(async move { watcher.watch_file(path, Duration::from_millis(20)).await })
    };

    std::fs::write(
        &path,
        "servers:\n  - id: fs\n    transport:\n      type: local\n      command: fake\n",
    )
    .unwrap();
    assert!(eventually(|| router.connection("fs").is_some()).await);

    std::fs::write(&path, "servers: [ this is : not valid").unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(router.connection("fs").is_some());

    task.abort();
    router.shutdown().await;
}

#[tokio::test]
async fn test_missing_binary_stays_registered_and_disconnected() {
    let router = Router::with_connector(&config(), Arc::new(DefaultConnector::default()));
    let definition = ServerDefinition::local(id("ghost"), "/nonexistent/op-mcp-router-test-server", &[]);

    let err = router.register_server(definition).await.unwrap_err();
    assert!(matches!(err, RouterError::Transport { .. }));

    let report = router.list_servers().pop().unwrap();
    assert_eq!(report.id, id("ghost"));
    assert!(!report.status.is_serving());
    assert!(report.last_error.is_some());

    router.unregister_server("ghost").await.unwrap();
    assert!(router.list_servers().is_empty());
    router.shutdown().await;
}
