//! Operator login, second-factor enrollment and verification through the
//! router.

mod common;

use axum::http::StatusCode;
use common::*;
use deskrelay::identity::{otp, Role};
use serde_json::{json, Value};

fn current_code(seed_hex: &str) -> String {
    let seed = hex::decode(seed_hex).unwrap();
    let step = chrono::Utc::now().timestamp() as u64 / otp::STEP_SECS;
    otp::code_for_step(&seed, step).unwrap()
}

async fn login(app: &axum::Router, username: &str, password: &str) -> (StatusCode, Value) {
    call(
        app,
        json_request(
            "POST",
            "/auth/login",
            None,
            json!({"username": username, "password": password}),
        ),
    )
    .await
}

/// Walk an operator through setup and enable; returns the seed and the
/// backup codes.
async fn enable_second_factor(app: &axum::Router, session: &str) -> (String, Vec<String>) {
    let (status, setup) = call(app, json_request("POST", "/auth/2fa/setup", Some(session), json!({}))).await;
    assert_eq!(status, StatusCode::OK, "setup: {setup}");
    let seed = setup["seed"].as_str().unwrap().to_string();

    let (status, enabled) = call(
        app,
        json_request(
            "POST",
            "/auth/2fa/enable",
            Some(session),
            json!({"setup_token": setup["setup_token"], "code": current_code(&seed)}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "enable: {enabled}");
    let codes = enabled["backup_codes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();
    (seed, codes)
}

#[tokio::test]
async fn password_login_issues_a_working_session() {
    let state = test_state();
    let app = test_app(&state);
    create_operator(&state, "alice", Role::Technician);

    let (status, body) = login(&app, "alice", "wrong").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth_invalid");

    let (status, body) = login(&app, "nobody", PASSWORD).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth_invalid");

    let (status, body) = login(&app, "alice", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["principal"]["role"], "technician");
    let token = body["token"].as_str().unwrap();

    let (status, _) = call(&app, get_request("/api/endpoints", Some(token))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_require_credentials() {
    let state = test_state();
    let app = test_app(&state);

    let (status, body) = call(&app, get_request("/api/endpoints", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth_required");

    let (status, body) = call(&app, get_request("/api/endpoints", Some("not-a-token"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth_invalid");

    let (status, _) = call(&app, get_request("/health", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn second_factor_login_with_totp_and_backup_codes() {
    let state = test_state();
    let app = test_app(&state);
    let alice = create_operator(&state, "alice", Role::Technician);
    let (seed, backup_codes) = enable_second_factor(&app, &session_token(&state, &alice)).await;
    assert_eq!(backup_codes.len(), 10);

    // Password alone now yields only a second-factor token.
    let (status, body) = login(&app, "alice", PASSWORD).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["two_factor_required"], true);
    assert!(body.get("principal").is_none());
    let pending = body["token"].as_str().unwrap().to_string();

    // That token is not a session.
    let (status, _) = call(&app, get_request("/api/endpoints", Some(&pending))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(
        &app,
        json_request("POST", "/auth/2fa/verify", None, json!({"token": pending, "code": "000000x"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(
        &app,
        json_request(
            "POST",
            "/auth/2fa/verify",
            None,
            json!({"token": pending, "code": current_code(&seed)}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "verify: {body}");
    let session = body["token"].as_str().unwrap();
    let (status, _) = call(&app, get_request("/api/endpoints", Some(session))).await;
    assert_eq!(status, StatusCode::OK);

    // A backup code works exactly once.
    let code = backup_codes[0].to_uppercase();
    let (status, _) = call(
        &app,
        json_request("POST", "/auth/2fa/verify", None, json!({"token": pending, "code": code})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(
        &app,
        json_request("POST", "/auth/2fa/verify", None, json!({"token": pending, "code": code})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "auth_invalid");

    // Other codes are unaffected.
    let (status, _) = call(
        &app,
        json_request(
            "POST",
            "/auth/2fa/verify",
            None,
            json!({"token": pending, "code": backup_codes[1]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn session_token_cannot_stand_in_for_second_factor_token() {
    let state = test_state();
    let app = test_app(&state);
    let alice = create_operator(&state, "alice", Role::Technician);
    let session = session_token(&state, &alice);
    let (seed, _) = enable_second_factor(&app, &session).await;

    let (status, _) = call(
        &app,
        json_request(
            "POST",
            "/auth/2fa/verify",
            None,
            json!({"token": session, "code": current_code(&seed)}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn second_factor_cannot_be_set_up_twice() {
    let state = test_state();
    let app = test_app(&state);
    let alice = create_operator(&state, "alice", Role::Technician);
    let session = session_token(&state, &alice);
    enable_second_factor(&app, &session).await;

    let (status, body) = call(&app, json_request("POST", "/auth/2fa/setup", Some(&session), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");
}

#[tokio::test]
async fn technician_cannot_use_admin_routes() {
    let state = test_state();
    let app = test_app(&state);
    let tech = create_operator(&state, "tech", Role::Technician);
    let admin = create_operator(&state, "boss", Role::Admin);

    let (status, body) = call(
        &app,
        json_request(
            "POST",
            "/api/admin/tenants",
            Some(&session_token(&state, &tech)),
            json!({"name": "Acme"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "access_denied");

    let (status, body) = call(
        &app,
        json_request(
            "POST",
            "/api/admin/tenants",
            Some(&session_token(&state, &admin)),
            json!({"name": "Acme"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "Acme");

    // Admins cannot mint admins; only a superadmin can.
    let (status, _) = call(
        &app,
        json_request(
            "POST",
            "/api/admin/operators",
            Some(&session_token(&state, &admin)),
            json!({"username": "boss2", "role": "admin", "password": "pw"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
