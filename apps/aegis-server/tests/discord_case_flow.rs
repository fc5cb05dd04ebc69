use std::net::{IpAddr, SocketAddr};

use aegis_server::{build_router, AppConfig};
use axum::{
    body::Body,
    extract::connect_info::ConnectInfo,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};
use tower::ServiceExt;

const OWNER_ID: &str = "4001";
const AGENT_ID: &str = "4002";
const HOME_SERVER: &str = "9001";
const OTHER_SERVER: &str = "9002";

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        let read = stream.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
        let text = String::from_utf8_lossy(&buffer);
        if let Some(header_end) = text.find("\r\n\r\n") {
            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    if name.eq_ignore_ascii_case("content-length") {
                        value.trim().parse::<usize>().ok()
                    } else {
                        None
                    }
                })
                .unwrap_or(0);
            if buffer.len() >= header_end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Answers like the Discord API. The OAuth code doubles as the user id, so
/// `code=4002` logs in user 4002; user 4001 owns server 9001.
fn discord_response(request: &str) -> (&'static str, String) {
    let request_line = request.lines().next().unwrap_or_default();
    let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
    let bearer_user = request
        .lines()
        .find_map(|line| {
            let lower = line.to_ascii_lowercase();
            lower
                .strip_prefix("authorization: bearer token-")
                .map(|user| user.trim().to_owned())
        })
        .unwrap_or_default();

    if request_line.contains("/oauth2/token") {
        let code = body
            .split('&')
            .find_map(|pair| pair.strip_prefix("code="))
            .unwrap_or_default();
        let token = json!({
            "access_token": format!("token-{code}"),
            "refresh_token": "refresh",
            "expires_in": 604_800,
            "token_type": "Bearer"
        });
        return ("200 OK", token.to_string());
    }
    if request_line.contains("/users/@me/guilds") {
        let owner = bearer_user == OWNER_ID;
        let guilds = json!([
            {"id": HOME_SERVER, "name": "Aegis HQ", "owner": owner, "permissions": if owner { "8" } else { "0" }},
            {"id": OTHER_SERVER, "name": "Elsewhere", "owner": false, "permissions": "0"}
        ]);
        return ("200 OK", guilds.to_string());
    }
    if request_line.contains("/users/@me") {
        let user = json!({"id": bearer_user, "username": format!("agent_{bearer_user}")});
        return ("200 OK", user.to_string());
    }
    if request_line.contains("/members/") {
        return ("200 OK", json!({"roles": []}).to_string());
    }
    if request_line.contains("/guilds/") {
        let guild = json!({"owner_id": OWNER_ID, "roles": [{"id": HOME_SERVER, "permissions": "0"}]});
        return ("200 OK", guild.to_string());
    }
    ("404 Not Found", json!({"message": "unknown"}).to_string())
}

async fn spawn_discord_stub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let request = read_request(&mut stream).await;
                let (status, body) = discord_response(&request);
                let response = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://127.0.0.1:{}", addr.port())
}

fn app_config(api_base_url: String, bot_token: Option<&str>) -> AppConfig {
    AppConfig {
        rate_limit_requests_per_minute: 1_000,
        auth_route_requests_per_minute: 100,
        discord_client_id: Some(String::from("client-1")),
        discord_client_secret: Some(String::from("secret-1")),
        discord_redirect_uri: Some(String::from(
            "http://127.0.0.1:3000/auth/discord/callback",
        )),
        discord_api_base_url: api_base_url,
        discord_bot_token: bot_token.map(ToOwned::to_owned),
        bootstrap_invite_codes: vec![String::from("invite-alpha"), String::from("invite-beta")],
        bootstrap_overseers: vec![String::from("director")],
        ..AppConfig::default()
    }
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    token: Option<&str>,
    peer_ip: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    if let Some(peer_ip) = peer_ip {
        let ip: IpAddr = peer_ip.parse().unwrap();
        builder = builder.extension(ConnectInfo(SocketAddr::new(ip, 40_000)));
    }
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let request = builder
        .body(body.map_or_else(Body::empty, |payload| Body::from(payload.to_string())))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let payload = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, payload)
}

async fn discord_session(app: &Router, discord_user_id: &str) -> String {
    let (status, authorize) = send(app, "GET", "/auth/discord/login", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(authorize["url"].as_str().unwrap().contains("client_id=client-1"));
    let state = authorize["state"].as_str().unwrap();

    let uri = format!("/auth/discord/callback?code={discord_user_id}&state={state}");
    let (status, session) = send(app, "GET", &uri, None, None, None).await;
    assert_eq!(status, StatusCode::OK, "callback failed: {session}");
    assert_eq!(session["discordUserId"], discord_user_id);
    session["accessToken"].as_str().unwrap().to_owned()
}

async fn select(app: &Router, token: &str, server_id: &str) -> (StatusCode, Value) {
    send(
        app,
        "POST",
        "/session/server",
        Some(token),
        None,
        Some(json!({"serverId": server_id})),
    )
    .await
}

async fn signed_in(app: &Router, discord_user_id: &str) -> (String, Value) {
    let pending = discord_session(app, discord_user_id).await;
    let (status, selected) = select(app, &pending, HOME_SERVER).await;
    assert_eq!(status, StatusCode::OK, "selection failed: {selected}");
    (
        selected["accessToken"].as_str().unwrap().to_owned(),
        selected["principal"].clone(),
    )
}

/// Registers and logs in the bootstrap overseer `director`.
async fn local_overseer(app: &Router, invite_code: &str) -> String {
    let credentials = json!({"username": "director", "password": "director-password-1"});
    let mut registration = credentials.clone();
    registration["inviteCode"] = json!(invite_code);
    let (status, registered) =
        send(app, "POST", "/auth/register", None, None, Some(registration)).await;
    assert_eq!(status, StatusCode::CREATED, "register failed: {registered}");
    assert_eq!(registered["role"], "Overseer");
    let (status, login) = send(app, "POST", "/auth/login", None, None, Some(credentials)).await;
    assert_eq!(status, StatusCode::OK);
    login["accessToken"].as_str().unwrap().to_owned()
}

/// Signs `discord_user_id` into the server nobody has claimed yet, making
/// them its Overseer.
async fn foreign_overseer(app: &Router, discord_user_id: &str) -> String {
    let pending = discord_session(app, discord_user_id).await;
    let (status, selected) = select(app, &pending, OTHER_SERVER).await;
    assert_eq!(status, StatusCode::OK, "selection failed: {selected}");
    assert_eq!(selected["principal"]["role"], "Overseer");
    selected["accessToken"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn server_selection_only_accepts_listed_guilds_and_derives_owner_role() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let pending = discord_session(&app, OWNER_ID).await;

    let (status, _) = send(&app, "GET", "/auth/me", Some(&pending), None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, servers) = send(&app, "GET", "/servers", Some(&pending), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(servers["servers"].as_array().unwrap().len(), 2);

    let (status, body) = select(&app, &pending, "7777").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "access_denied");

    let (status, selected) = select(&app, &pending, HOME_SERVER).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(selected["principal"]["role"], "Overseer");
    assert_eq!(selected["principal"]["id"], "4001:9001");
    assert_eq!(selected["principal"]["username"], OWNER_ID);

    let token = selected["accessToken"].as_str().unwrap();
    let (status, me) = send(&app, "GET", "/auth/me", Some(token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["principal"]["serverId"], HOME_SERVER);

    let (status, again) = select(&app, &pending, HOME_SERVER).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["principal"]["role"], "Overseer");
}

#[tokio::test]
async fn case_lifecycle_through_delete_recovery_and_purge() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (token, _) = signed_in(&app, OWNER_ID).await;
    let token = Some(token.as_str());

    let (status, created) = send(
        &app,
        "POST",
        "/cases",
        token,
        None,
        Some(json!({
            "title": "Project X",
            "content": "first draft",
            "priority": "High",
            "tags": ["alpha", " alpha ", "beta"],
            "googleDocUrl": "https://docs.google.com/document/d/1",
            "isPublic": true
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create failed: {created}");
    let case_id = created["id"].as_str().unwrap().to_owned();
    assert!(case_id.starts_with("CASE-"));
    assert_eq!(created["assignedAgent"], OWNER_ID);
    assert_eq!(created["isPublic"], false);
    assert_eq!(created["serverId"], HOME_SERVER);
    assert_eq!(created["tags"], json!(["alpha", "beta"]));

    let (status, logs) = send(&app, "GET", "/logs?action=CASE_CREATE", token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(logs["logs"][0]["targetId"], case_id.as_str());

    let case_uri = format!("/cases/{case_id}");
    let (status, _) = send(
        &app,
        "PATCH",
        &case_uri,
        token,
        None,
        Some(json!({"content": "tampered", "serverId": OTHER_SERVER})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, updated) = send(
        &app,
        "PATCH",
        &case_uri,
        token,
        None,
        Some(json!({"content": "second draft", "serverId": HOME_SERVER})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["content"], "second draft");

    let (status, deleted) = send(
        &app,
        "DELETE",
        &format!("{case_uri}?serverId={HOME_SERVER}"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT, "delete failed: {deleted}");
    let (status, missing) = send(&app, "GET", &case_uri, token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(missing.is_null());

    let (status, recovery) = send(&app, "GET", "/recovery/cases", token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(recovery["cases"][0]["caseId"], case_id.as_str());
    assert_eq!(recovery["cases"][0]["hasEmbed"], true);

    let embed_uri = format!("/recovery/cases/{case_id}/remove-embed");
    let (status, _) = send(&app, "POST", &embed_uri, token, None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let restore_uri = format!("/recovery/cases/{case_id}/restore");
    let (status, restored) = send(&app, "POST", &restore_uri, token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["restored"], true);
    assert_eq!(restored["case"]["title"], "Project X");
    assert_eq!(restored["case"]["content"], "second draft");
    assert_eq!(restored["case"]["priority"], "High");
    assert!(restored["case"]["googleDocUrl"].is_null());

    let (status, again) = send(&app, "POST", &restore_uri, token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["restored"], false);

    let (status, _) = send(&app, "DELETE", &case_uri, token, None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(
        &app,
        "DELETE",
        &format!("/recovery/cases/{case_id}"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&app, "POST", &restore_uri, token, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
    let (status, recovery) = send(&app, "GET", "/recovery/cases", token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(recovery["cases"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn encrypted_and_public_reads_follow_code_and_visibility() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (token, _) = signed_in(&app, OWNER_ID).await;
    let token = Some(token.as_str());

    let (_, created) = send(
        &app,
        "POST",
        "/cases",
        token,
        None,
        Some(json!({"title": "Sealed"})),
    )
    .await;
    let case_id = created["id"].as_str().unwrap().to_owned();
    let case_uri = format!("/cases/{case_id}");

    let (status, body) = send(&app, "GET", &case_uri, None, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "access_denied");

    let (status, encrypted) = send(
        &app,
        "POST",
        &format!("{case_uri}/encrypt"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = encrypted["caseCode"].as_str().unwrap().to_owned();
    assert_eq!(code.chars().count(), 12);

    let (status, body) = send(&app, "GET", &case_uri, token, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "case_locked");

    let request = Request::builder()
        .method("GET")
        .uri(&case_uri)
        .header("authorization", format!("Bearer {}", token.unwrap()))
        .header("x-case-code", &code)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let unlocked: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(unlocked["isEncrypted"], true);
    assert!(unlocked.get("caseCode").is_none());

    let (status, decrypted) = send(
        &app,
        "POST",
        &format!("{case_uri}/decrypt"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(decrypted["isEncrypted"], false);

    let (status, toggled) = send(
        &app,
        "POST",
        &format!("{case_uri}/visibility"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(toggled["isPublic"], true);
    let (status, public) = send(&app, "GET", &case_uri, None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(public["title"], "Sealed");
    let (status, listed) = send(&app, "GET", "/cases/public", None, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["cases"][0]["id"], case_id.as_str());
}

#[tokio::test]
async fn agent_gains_management_only_after_reselecting_the_server() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (owner_token, _) = signed_in(&app, OWNER_ID).await;
    let owner = Some(owner_token.as_str());
    let agent_pending = discord_session(&app, AGENT_ID).await;
    let (_, selected) = select(&app, &agent_pending, HOME_SERVER).await;
    assert_eq!(selected["principal"]["role"], "Agent");
    let agent_token = selected["accessToken"].as_str().unwrap().to_owned();
    let agent = Some(agent_token.as_str());

    let (status, created) = send(
        &app,
        "POST",
        "/cases",
        agent,
        None,
        Some(json!({"title": "Field report"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["assignedAgent"], AGENT_ID);
    let case_uri = format!("/cases/{}", created["id"].as_str().unwrap());

    for (method, uri) in [
        ("DELETE", case_uri.clone()),
        ("POST", format!("{case_uri}/visibility")),
        ("POST", format!("{case_uri}/encrypt")),
        ("GET", String::from("/logs")),
        ("GET", String::from("/recovery/cases")),
        ("GET", String::from("/users")),
    ] {
        let (status, body) = send(&app, method, &uri, agent, None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(body["error"], "access_denied");
    }
    let (status, _) = send(
        &app,
        "PUT",
        &format!("/servers/{HOME_SERVER}/config"),
        agent,
        None,
        Some(json!({"raidProtection": true, "joinRateThreshold": 5, "commandPermissions": {}})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, member) = send(
        &app,
        "PATCH",
        &format!("/servers/{HOME_SERVER}/members/{AGENT_ID}"),
        owner,
        None,
        Some(json!({"isAdmin": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(member["isAdmin"], true);

    let (status, _) = send(&app, "DELETE", &case_uri, agent, None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, reselected) = select(&app, &agent_pending, HOME_SERVER).await;
    assert_eq!(reselected["principal"]["role"], "Management");
    let promoted = reselected["accessToken"].as_str().unwrap().to_owned();
    let (status, _) = send(&app, "DELETE", &case_uri, Some(&promoted), None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn server_config_is_owner_managed_and_member_readable() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (owner_token, _) = signed_in(&app, OWNER_ID).await;
    let (agent_token, _) = signed_in(&app, AGENT_ID).await;
    let config_uri = format!("/servers/{HOME_SERVER}/config");

    let (status, defaults) = send(&app, "GET", &config_uri, Some(&agent_token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(defaults["raidProtection"], false);

    let config = json!({
        "raidProtection": true,
        "joinRateThreshold": 4,
        "commandPermissions": {"case-lookup": "Management"}
    });
    let (status, stored) = send(
        &app,
        "PUT",
        &config_uri,
        Some(&owner_token),
        None,
        Some(config.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored, config);

    let (_, read_back) = send(&app, "GET", &config_uri, Some(&agent_token), None, None).await;
    assert_eq!(read_back, config);
    let (status, _) = send(
        &app,
        "GET",
        &format!("/servers/{OTHER_SERVER}/config"),
        Some(&agent_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn dashboard_admission_prefers_the_live_oracle() {
    let stub = spawn_discord_stub().await;
    let live_app = build_router(&app_config(stub.clone(), Some("bot-token"))).unwrap();
    let (owner_token, _) = signed_in(&live_app, OWNER_ID).await;
    let dashboard_uri = format!("/servers/{HOME_SERVER}/dashboard");
    let (status, admission) = send(
        &live_app,
        "GET",
        &dashboard_uri,
        Some(&owner_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(admission["source"], "live");
    assert_eq!(admission["admitted"], true);

    let (agent_token, _) = signed_in(&live_app, AGENT_ID).await;
    let (status, _) = send(
        &live_app,
        "GET",
        &dashboard_uri,
        Some(&agent_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let snapshot_app = build_router(&app_config(stub, None)).unwrap();
    let (owner_token, _) = signed_in(&snapshot_app, OWNER_ID).await;
    let (status, admission) = send(
        &snapshot_app,
        "GET",
        &dashboard_uri,
        Some(&owner_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(admission["source"], "snapshot");
}

#[tokio::test]
async fn suspending_a_local_user_bans_their_address_until_lifted() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let banned_ip = Some("198.51.100.20");
    let other_ip = Some("198.51.100.21");

    let (status, registered) = send(
        &app,
        "POST",
        "/auth/register",
        None,
        banned_ip,
        Some(json!({
            "username": "field_agent",
            "password": "super-secure-password",
            "inviteCode": "invite-alpha"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_id = registered["id"].as_str().unwrap().to_owned();
    let login_body = json!({"username": "field_agent", "password": "super-secure-password"});
    let (status, login) = send(
        &app,
        "POST",
        "/auth/login",
        None,
        banned_ip,
        Some(login_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let local_token = login["accessToken"].as_str().unwrap().to_owned();

    let (owner_token, _) = signed_in(&app, OWNER_ID).await;
    let (status, _) = send(
        &app,
        "POST",
        &format!("/users/{user_id}/suspend"),
        Some(&owner_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let director_token = local_overseer(&app, "invite-beta").await;
    let (status, suspended) = send(
        &app,
        "POST",
        &format!("/users/{user_id}/suspend"),
        Some(&director_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(suspended["isSuspended"], true);

    let (status, body) = send(
        &app,
        "POST",
        "/auth/login",
        None,
        banned_ip,
        Some(login_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "ip_banned");
    let (status, verdict) = send(&app, "GET", "/auth/check-ip", None, banned_ip, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(verdict["banned"], true);
    let (status, _) = send(&app, "GET", "/health", None, banned_ip, None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, verdict) = send(&app, "GET", "/auth/check-ip", None, other_ip, None).await;
    assert_eq!(verdict["banned"], false);
    let (status, _) = send(&app, "GET", "/auth/me", Some(&local_token), other_ip, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/users/{user_id}/unsuspend"),
        Some(&director_token),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, relogin) = send(&app, "POST", "/auth/login", None, banned_ip, Some(login_body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(relogin["principal"]["kind"], "local");
    assert_eq!(relogin["principal"]["role"], "Agent");
}

#[tokio::test]
async fn overseer_of_another_server_cannot_touch_home_cases() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (owner_token, _) = signed_in(&app, OWNER_ID).await;
    let owner = Some(owner_token.as_str());
    let rival_token = foreign_overseer(&app, AGENT_ID).await;
    let rival = Some(rival_token.as_str());

    let (status, created) = send(
        &app,
        "POST",
        "/cases",
        owner,
        None,
        Some(json!({"title": "Home case", "content": "home notes"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let case_id = created["id"].as_str().unwrap().to_owned();
    let case_uri = format!("/cases/{case_id}");

    let (status, body) = send(
        &app,
        "PATCH",
        &case_uri,
        rival,
        None,
        Some(json!({"content": "overwritten"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], "access_denied");
    for (method, uri) in [
        ("POST", format!("{case_uri}/visibility")),
        ("POST", format!("{case_uri}/encrypt")),
        ("DELETE", case_uri.clone()),
    ] {
        let (status, _) = send(&app, method, &uri, rival, None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
    }

    let (status, _) = send(&app, "DELETE", &case_uri, owner, None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, recovery) = send(&app, "GET", "/recovery/cases", rival, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(recovery["cases"].as_array().unwrap().is_empty());
    for (method, uri) in [
        ("POST", format!("/recovery/cases/{case_id}/restore")),
        ("POST", format!("/recovery/cases/{case_id}/remove-embed")),
        ("DELETE", format!("/recovery/cases/{case_id}")),
    ] {
        let (status, _) = send(&app, method, &uri, rival, None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
    }

    let (status, restored) = send(
        &app,
        "POST",
        &format!("/recovery/cases/{case_id}/restore"),
        owner,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["restored"], true);
    assert_eq!(restored["case"]["content"], "home notes");
    assert_eq!(restored["case"]["isPublic"], false);
}

#[tokio::test]
async fn audit_log_never_exposes_case_code_or_content() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (token, _) = signed_in(&app, OWNER_ID).await;
    let token = Some(token.as_str());

    let (_, created) = send(
        &app,
        "POST",
        "/cases",
        token,
        None,
        Some(json!({"title": "Sealed dossier", "content": "informant lives at pier nine"})),
    )
    .await;
    let case_id = created["id"].as_str().unwrap().to_owned();
    let case_uri = format!("/cases/{case_id}");
    let (status, encrypted) = send(
        &app,
        "POST",
        &format!("{case_uri}/encrypt"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = encrypted["caseCode"].as_str().unwrap().to_owned();
    let (status, _) = send(&app, "DELETE", &case_uri, token, None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, logs) = send(&app, "GET", "/logs", token, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let rendered = logs.to_string();
    assert!(!rendered.contains(&code));
    assert!(!rendered.contains("pier nine"));
    let deleted = logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["action"] == "CASE_DELETE")
        .expect("delete entry listed");
    assert!(deleted["details"].as_str().unwrap().contains("Sealed dossier"));

    let (status, restored) = send(
        &app,
        "POST",
        &format!("/recovery/cases/{case_id}/restore"),
        token,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["case"]["isEncrypted"], true);
    assert_eq!(restored["case"]["content"], "informant lives at pier nine");
}

#[tokio::test]
async fn account_admin_and_logs_stay_out_of_reach_of_discord_overseers() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (owner_token, _) = signed_in(&app, OWNER_ID).await;
    let owner = Some(owner_token.as_str());
    let rival_token = foreign_overseer(&app, AGENT_ID).await;
    let rival = Some(rival_token.as_str());

    let (status, created) = send(
        &app,
        "POST",
        "/cases",
        owner,
        None,
        Some(json!({"title": "Home case"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let case_id = created["id"].as_str().unwrap().to_owned();

    for (method, uri, body) in [
        ("GET", "/users", None),
        ("GET", "/invite-codes", None),
        ("POST", "/invite-codes", Some(json!({}))),
    ] {
        let (status, payload) = send(&app, method, uri, rival, None, body).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "{method} {uri}");
        assert_eq!(payload["error"], "access_denied");
    }

    let (status, home_logs) = send(&app, "GET", "/logs", owner, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(home_logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|entry| entry["targetId"] == case_id.as_str()));
    let (status, rival_logs) = send(&app, "GET", "/logs", rival, None, None).await;
    assert_eq!(status, StatusCode::OK);
    let rival_logs = rival_logs["logs"].as_array().unwrap();
    assert!(!rival_logs.is_empty());
    assert!(rival_logs
        .iter()
        .all(|entry| entry["serverId"] == OTHER_SERVER));

    let director_token = local_overseer(&app, "invite-alpha").await;
    let (status, users) = send(&app, "GET", "/users", Some(&director_token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(users["users"]
        .as_array()
        .unwrap()
        .iter()
        .any(|user| user["username"] == "director"));
    let (status, all_logs) = send(&app, "GET", "/logs", Some(&director_token), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(all_logs["logs"]
        .as_array()
        .unwrap()
        .iter()
        .any(|entry| entry["targetId"] == case_id.as_str()));
}

#[tokio::test]
async fn stale_credentials_still_read_public_cases() {
    let app = build_router(&app_config(spawn_discord_stub().await, None)).unwrap();
    let (token, _) = signed_in(&app, OWNER_ID).await;
    let owner = Some(token.as_str());

    let mut case_uris = Vec::new();
    for title in ["Open file", "Closed file"] {
        let (_, created) = send(
            &app,
            "POST",
            "/cases",
            owner,
            None,
            Some(json!({"title": title})),
        )
        .await;
        case_uris.push(format!("/cases/{}", created["id"].as_str().unwrap()));
    }
    let (status, _) = send(
        &app,
        "POST",
        &format!("{}/visibility", case_uris[0]),
        owner,
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(&app, "POST", "/auth/logout", owner, None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    for stale in [token.as_str(), "not-a-real-token"] {
        let (status, public) = send(&app, "GET", &case_uris[0], Some(stale), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(public["title"], "Open file");
        let (status, body) = send(&app, "GET", &case_uris[1], Some(stale), None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "access_denied");
    }
}
