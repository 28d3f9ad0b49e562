//! Scaffold HTTP bridge for LIVE computer-use mode.
//!
//! Every action is answered with 501. The screenshot endpoint serves a
//! placeholder PNG so clients can exercise their image path end to end.

use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use image::{ImageFormat, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Cursor;

use crate::computer::font::{draw_text, fill_rect};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeActionRequest {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

pub fn bridge_router() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/action", post(action))
        .route("/screenshot", get(screenshot))
        .route("/reset", post(reset))
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "Computer Use Live Bridge",
        "status": "scaffold",
        "endpoints": {
            "/health": "Check bridge health",
            "/action": "Execute browser action (501 Not Implemented)",
            "/screenshot": "Get current screenshot",
        }
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "mode": "LIVE",
        "status": "scaffold",
        "message": "Bridge is running but browser integration not implemented",
    }))
}

async fn action(Json(request): Json<BridgeActionRequest>) -> impl IntoResponse {
    tracing::info!("[bridge] received action: {} {:?}", request.action_type, request.params);
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({
            "error": "Not Implemented",
            "message": "Live browser integration is not yet implemented",
            "action": request.action_type,
            "note": "Use COMPUTER_MODE=MOCK for testing",
        })),
    )
}

async fn screenshot() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::HeaderName::from_static("x-bridge-status"), "scaffold"),
        ],
        placeholder_png(),
    )
}

async fn reset() -> Json<serde_json::Value> {
    Json(json!({ "success": true, "message": "Browser reset (no-op in scaffold mode)" }))
}

fn placeholder_png() -> Vec<u8> {
    let mut img = RgbImage::from_pixel(1024, 640, Rgb([0xf0, 0xf0, 0xf0]));
    fill_rect(&mut img, 0, 0, 1024, 60, Rgb([0xef, 0x44, 0x44]));
    draw_text(&mut img, 20, 20, "LIVE BRIDGE - NOT IMPLEMENTED", 3, Rgb([0xff, 0xff, 0xff]));
    let body = Rgb([0x37, 0x41, 0x51]);
    draw_text(&mut img, 30, 100, "Live browser integration is not yet implemented.", 2, body);
    draw_text(&mut img, 30, 140, "Use COMPUTER_MODE=MOCK for testing.", 2, body);

    let mut buf = Cursor::new(Vec::new());
    if let Err(e) = img.write_to(&mut buf, ImageFormat::Png) {
        tracing::warn!("[bridge] failed to encode placeholder: {}", e);
    }
    buf.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_action_is_not_implemented() {
        let response = bridge_router()
            .oneshot(
                Request::post("/action")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"type":"click","x":1,"y":2}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["action"], "click");
    }

    #[tokio::test]
    async fn test_screenshot_is_png() {
        let response = bridge_router()
            .oneshot(Request::get("/screenshot").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-bridge-status"], "scaffold");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.starts_with(&[0x89, b'P', b'N', b'G']));
    }
}
