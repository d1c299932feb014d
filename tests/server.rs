#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header},
    };
    use base64::Engine;
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use bollard::Docker;
    use dockman::dispatch::{AppInfo, DispatchOptions, Dispatcher};
    use dockman::docker::client::ConnectedClient;
    use dockman::docker::pool::HostPool;
    use dockman::files::FileStore;
    use dockman::git::{Author, CommitInfo, Historian};
    use dockman::inbound::server::{ApiResponse, AppState, CONTENTS_FIELD, Credentials, create_app};
    use dockman::outbound::sqlite::Sqlite;
    use dockman::shared::HostName;
    use serde::de::DeserializeOwned;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "dockman-test-boundary";

    struct TestApp {
        app: Router,
        _root: TempDir,
        _config: TempDir,
    }

    async fn setup_test_app() -> TestApp {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", config.path().join("dockman.db").display());
        let store = Sqlite::open(&url).await.unwrap();

        // never dialed unless a handler talks to docker
        let docker =
            Docker::connect_with_http("tcp://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
                .unwrap();
        let client = ConnectedClient::from_docker(HostName::local(), docker);
        let pool = Arc::new(HostPool::from_clients(vec![client], None).unwrap());

        let historian = Historian::open(root.path(), Author::default(), Duration::from_secs(10))
            .await
            .unwrap();
        historian.switch_branch("local").await.unwrap();
        let files = FileStore::open(root.path()).unwrap();
        let options = DispatchOptions {
            machine_addr: "127.0.0.1".to_string(),
            preferences_path: root.path().join(".dockman.yml"),
        };
        let dispatcher = Dispatcher::new(store, pool, historian, files, options);

        let state = AppState {
            dispatcher: Arc::new(dispatcher),
            credentials: Some(Credentials {
                user: "admin".to_string(),
                pass: "tests-secret".to_string(),
            }),
            origins: Arc::new(vec!["http://localhost:5173".to_string()]),
        };
        TestApp {
            app: create_app(state).await,
            _root: root,
            _config: config,
        }
    }

    fn auth() -> String {
        format!("Basic {}", STANDARD.encode("admin:tests-secret"))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, auth())
            .body(Body::empty())
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::AUTHORIZATION, auth())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn upload(name: &str, contents: &str) -> Request<Body> {
        let body = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{CONTENTS_FIELD}\"; filename=\"{}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {contents}\r\n\
             --{BOUNDARY}--\r\n",
            STANDARD.encode(name)
        );
        Request::builder()
            .method("POST")
            .uri("/files/save")
            .header(header::AUTHORIZATION, auth())
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn read<T: DeserializeOwned>(response: axum::response::Response) -> ApiResponse<T> {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint_no_auth_required() {
        let t = setup_test_app().await;
        let response = t
            .app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_requests_without_valid_credentials_are_rejected() {
        let t = setup_test_app().await;
        let response = t
            .app
            .clone()
            .oneshot(Request::builder().uri("/files/list").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/files/list")
                    .header(
                        header::AUTHORIZATION,
                        format!("Basic {}", STANDARD.encode("admin:wrong")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ApiResponse<()> = read(response).await;
        assert!(!body.success);
    }

    #[tokio::test]
    async fn test_saved_files_load_back_with_history() {
        let t = setup_test_app().await;
        let response = t
            .app
            .clone()
            .oneshot(upload("web/compose.yaml", "services: {}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let encoded = URL_SAFE.encode("web/compose.yaml");
        let response = t
            .app
            .clone()
            .oneshot(get(&format!("/files/load/{encoded}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"services: {}");

        let response = t
            .app
            .oneshot(post_json(
                "/files/history",
                serde_json::json!({"filename": "web/compose.yaml"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history: ApiResponse<Vec<CommitInfo>> = read(response).await;
        let history = history.data.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].message, "update web/compose.yaml");
    }

    #[tokio::test]
    async fn test_error_kinds_map_to_statuses() {
        let t = setup_test_app().await;

        let response = t
            .app
            .clone()
            .oneshot(post_json(
                "/files/load-at-commit",
                serde_json::json!({"filename": "web/compose.yaml", "commit": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = t
            .app
            .clone()
            .oneshot(post_json("/host/get", serde_json::json!({"name": "nas"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = t
            .app
            .clone()
            .oneshot(post_json(
                "/files/create",
                serde_json::json!({"filename": "../outside.yaml"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = t.app.oneshot(get("/info/get-changelog")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn test_app_info_names_the_active_host() {
        let t = setup_test_app().await;
        let response = t.app.oneshot(get("/info/get-app-info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let info: ApiResponse<AppInfo> = read(response).await;
        assert!(info.success);
        assert_eq!(info.data.unwrap().active_host, HostName::local());
    }

    #[tokio::test]
    async fn test_preflight_from_allowed_origin() {
        let t = setup_test_app().await;
        let response = t
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/files/list")
                    .header(header::ORIGIN, "http://localhost:5173")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "http://localhost:5173"
        );

        let response = t
            .app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "http://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(
            !response
                .headers()
                .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN)
        );
    }
}
