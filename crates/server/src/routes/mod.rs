pub mod error;
pub mod health;
pub mod models;
pub mod system;
pub mod transfers;
pub mod ws;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Full application router with CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(health::router())
        .merge(models::router())
        .merge(transfers::router())
        .merge(system::router())
        .merge(ws::router())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use gguf_parser::{GGMLType, GGUFError, GGUFMetadataKV, GGUFValue, ParsedModel, TensorInfo};
    use http_body_util::BodyExt;
    use model_store::{Engine, EngineOptions};
    use serde_json::{Value, json};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::app;
    use crate::config::AppConfig;
    use crate::state::AppState;

    fn test_app(dir: &TempDir) -> Router {
        let engine = Engine::open(dir.path().join("models"), EngineOptions::default()).unwrap();
        app(AppState::new(AppConfig::default(), Arc::new(engine)))
    }

    fn write_gguf(path: &Path) -> Vec<u8> {
        let metadata = vec![
            GGUFMetadataKV::new("general.architecture", GGUFValue::String("llama".into())),
            GGUFMetadataKV::new("general.name", GGUFValue::String("Demo".into())),
        ];
        let payloads: Vec<Vec<u8>> = (0..2u8).map(|s| vec![s + 1; 64]).collect();
        let infos = vec![
            TensorInfo::new("token_embd.weight", vec![16], GGMLType::F32).unwrap(),
            TensorInfo::new("output.weight", vec![16], GGMLType::F32).unwrap(),
        ];
        let model = ParsedModel::new(3, metadata, infos).unwrap();
        let mut bytes = Vec::new();
        gguf_parser::serialize(&mut bytes, &model, |i, _, w| {
            w.write_all(&payloads[i])?;
            Ok::<_, GGUFError>(())
        })
        .unwrap();
        std::fs::write(path, &bytes).unwrap();
        bytes
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Poll a transfer until it carries a message key.
    async fn wait_for(app: &Router, id: &str) -> Value {
        for _ in 0..500 {
            let (status, report) = call(app, "GET", &format!("/api/transfers/{id}"), None).await;
            // Briefly absent between deregistration and history.
            if status == StatusCode::OK && !report["message_key"].is_null() {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transfer {id} did not finish");
    }

    #[tokio::test]
    async fn health_reports_store() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn import_list_export_delete() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let source = dir.path().join("demo.gguf");
        let original = write_gguf(&source);

        let (status, body) = call(&app, "GET", "/api/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, body) =
            call(&app, "POST", "/api/models/import", Some(json!({ "path": source }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let report = wait_for(&app, body["id"].as_str().unwrap()).await;
        assert_eq!(report["message_key"], "success");
        assert_eq!(report["state"], "done");

        let (_, body) = call(&app, "GET", "/api/models", None).await;
        assert_eq!(body[0]["name"], "demo:latest");
        assert_eq!(body[0]["architecture"], "llama");

        let (status, body) = call(&app, "GET", "/api/models/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["manifest"]["layers"].as_array().unwrap().len(), 3);

        let target = dir.path().join("out/demo.gguf");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        let (status, body) = call(
            &app,
            "POST",
            "/api/models/demo/export",
            Some(json!({ "path": target })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let report = wait_for(&app, body["id"].as_str().unwrap()).await;
        assert_eq!(report["message_key"], "success");
        assert_eq!(std::fs::read(&target).unwrap(), original);

        let (status, _) = call(&app, "DELETE", "/api/models/demo", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = call(&app, "GET", "/api/models/demo", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["type"], "not_found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_import_reports_message_key() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let source = dir.path().join("broken.gguf");
        std::fs::write(&source, b"not a gguf file at all").unwrap();

        let (_, body) =
            call(&app, "POST", "/api/models/import", Some(json!({ "path": source }))).await;
        let report = wait_for(&app, body["id"].as_str().unwrap()).await;
        assert_eq!(report["message_key"], "import_failure");
        assert_eq!(report["state"], "failed");
        assert!(report["error"].is_string());

        let (_, body) = call(&app, "GET", "/api/models", None).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn bad_requests_are_rejected() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);

        let missing = dir.path().join("missing.gguf");
        let (status, _) =
            call(&app, "POST", "/api/models/import", Some(json!({ "path": missing }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, "GET", "/api/transfers/not-an-id", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let unknown = model_store::SessionId::new();
        let (status, _) =
            call(&app, "POST", &format!("/api/transfers/{unknown}/cancel"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, "DELETE", "/api/models/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "load_failure");
    }

    #[tokio::test]
    async fn prune_and_info() {
        let dir = TempDir::new().unwrap();
        let app = test_app(&dir);
        let (status, body) = call(&app, "POST", "/api/system/prune", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["blobs_removed"], 0);

        let (status, body) = call(&app, "GET", "/api/system/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["models"], 0);
        assert_eq!(body["max_concurrent_transfers"], 2);
    }
}
