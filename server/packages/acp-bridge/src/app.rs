use std::sync::Arc;

use acp_bridge_error::{BridgeError, ProblemDetails};
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::bridge::{Bridge, MessageRequest, ProviderInfo};
use crate::notifications::SlashCommand;
use crate::provider::ProviderRef;
use crate::stream::NDJSON_CONTENT_TYPE;

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlashCommandsQuery {
    provider_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SlashCommandsResponse {
    commands: Vec<SlashCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetSessionRequest {
    provider: ProviderRef,
    composer_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetSessionResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct InitSessionRequest {
    provider: ProviderRef,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitSessionResponse {
    session_id: String,
    commands: Vec<SlashCommand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    provider: ProviderRef,
    message: String,
    #[serde(default)]
    composer_id: Option<String>,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ProvidersResponse {
    providers: Vec<ProviderInfo>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    ok: bool,
    error: ProblemDetails,
}

pub fn build_router(bridge: Arc<Bridge>) -> Router {
    Router::new()
        .route("/acp/health", get(get_health))
        .route("/acp/providers", get(get_providers))
        .route("/acp/getSlashCommands", get(get_slash_commands))
        .route("/acp/getSession", post(post_get_session))
        .route("/acp/initSession", post(post_init_session))
        .route("/acp/sendMessage", post(post_send_message))
        .with_state(bridge)
}

async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn get_providers(State(bridge): State<Arc<Bridge>>) -> Json<ProvidersResponse> {
    Json(ProvidersResponse {
        providers: bridge.providers().await,
    })
}

async fn get_slash_commands(
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<SlashCommandsQuery>,
) -> Response {
    let Some(provider_id) = query.provider_id.filter(|id| !id.is_empty()) else {
        return error_response(BridgeError::InvalidRequest {
            message: "providerId query parameter is required".to_string(),
        });
    };
    Json(SlashCommandsResponse {
        commands: bridge.slash_commands(&provider_id),
    })
    .into_response()
}

async fn post_get_session(State(bridge): State<Arc<Bridge>>, body: Bytes) -> Response {
    let request: GetSessionRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };

    match bridge
        .get_session(&request.provider, &request.composer_id)
        .await
    {
        Ok(session_id) => Json(GetSessionResponse { session_id }).into_response(),
        Err(err) => error_response(err),
    }
}

async fn post_init_session(
    State(bridge): State<Arc<Bridge>>,
    body: Bytes,
) -> Response {
    let request: InitSessionRequest = match parse_body(&body) {
        Ok(request) => request,
        Err(err) => return error_response(err),
    };

    match bridge.init_session(&request.provider).await {
        Ok((session_id, commands)) => Json(InitSessionResponse {
            session_id,
            commands,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}

async fn post_send_message(
    State(bridge): State<Arc<Bridge>>,
    body: Bytes,
) -> Response {
    let body: SendMessageRequest = match parse_body(&body) {
        Ok(body) => body,
        Err(err) => return error_response(err),
    };
    let request = MessageRequest {
        provider: body.provider,
        message: body.message,
        conversation_id: body.composer_id.filter(|id| !id.is_empty()),
    };

    if !body.stream {
        return match bridge.send_message(&request).await {
            Ok(response) => Json(response).into_response(),
            Err(err) => error_response(err),
        };
    }

    match bridge.stream_message(&request).await {
        Ok(records) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(records),
        )
            .into_response(),
        Err(err) => error_response(err),
    }
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, BridgeError> {
    serde_json::from_slice(body).map_err(|err| BridgeError::InvalidRequest {
        message: format!("invalid request body: {err}"),
    })
}

fn error_response(err: BridgeError) -> Response {
    let problem = err.to_problem_details();
    let status =
        StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::warn!(status = status.as_u16(), error = %err, "request failed");
    }
    (
        status,
        Json(ErrorBody {
            ok: false,
            error: problem,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::provider::ProviderRegistry;
    use crate::BridgeConfig;

    fn router() -> Router {
        build_router(Arc::new(Bridge::new(
            BridgeConfig::default(),
            ProviderRegistry::default(),
        )))
    }

    async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let request = Request::get("/acp/health").body(Body::empty()).expect("request");
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn slash_commands_default_to_empty() {
        let request = Request::get("/acp/getSlashCommands?providerId=nobody")
            .body(Body::empty())
            .expect("request");
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["commands"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn unknown_provider_is_a_not_found_problem() {
        let request = post_json(
            "/acp/getSession",
            serde_json::json!({ "provider": "nobody", "composerId": "c1" }),
        );
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["type"], "urn:acp-bridge:error:provider_not_found");
        assert_eq!(body["error"]["provider"], "nobody");
    }

    #[tokio::test]
    async fn malformed_bodies_are_invalid_requests() {
        let request = post_json("/acp/sendMessage", serde_json::json!({ "provider": "x" }));
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["type"], "urn:acp-bridge:error:invalid_request");
    }

    #[tokio::test]
    async fn unparseable_json_gets_a_problem_body() {
        let request = Request::post("/acp/sendMessage")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .expect("request");
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"]["type"], "urn:acp-bridge:error:invalid_request");
        assert_eq!(body["error"]["status"], 400);
    }

    #[tokio::test]
    async fn bodies_without_a_content_type_are_still_parsed() {
        let request = Request::post("/acp/getSession")
            .body(Body::from(r#"{"provider":"nobody","composerId":"c1"}"#))
            .expect("request");
        let (status, body) = call(router(), request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "urn:acp-bridge:error:provider_not_found");
    }
}
