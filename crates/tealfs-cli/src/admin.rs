//! Admin HTTP surface: attach disks, dial peers, list live peers.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Form, State};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use http::StatusCode;
use serde::Deserialize;
use tealfs_rs::Node;
use tracing::{info, warn};

#[derive(Deserialize)]
pub struct AddDiskForm {
    #[serde(rename = "diskPath")]
    disk_path: String,
}

#[derive(Deserialize)]
pub struct ConnectToForm {
    #[serde(rename = "hostAndPort")]
    host_and_port: String,
}

pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/add-disk", put(add_disk))
        .route("/connect-to", put(connect_to))
        .route("/connection-status", get(connection_status))
        .with_state(node)
}

async fn add_disk(
    State(node): State<Arc<Node>>,
    Form(form): Form<AddDiskForm>,
) -> impl IntoResponse {
    let path = form.disk_path.trim();
    if path.is_empty() {
        return (StatusCode::BAD_REQUEST, "diskPath is required\n".to_string());
    }
    match node.add_disk(path).await {
        Ok(disk_id) => {
            info!("admin: disk {disk_id} at {path}");
            (StatusCode::OK, format!("{disk_id}\n"))
        }
        Err(err) => {
            warn!("admin: add-disk {path} failed: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}\n"))
        }
    }
}

async fn connect_to(
    State(node): State<Arc<Node>>,
    Form(form): Form<ConnectToForm>,
) -> impl IntoResponse {
    let address = form.host_and_port.trim().to_string();
    if address.is_empty() {
        return (StatusCode::BAD_REQUEST, "hostAndPort is required\n".to_string());
    }
    match node.connect_to(address.clone()).await {
        Ok(()) => (StatusCode::OK, format!("connecting to {address}\n")),
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}\n")),
    }
}

async fn connection_status(State(node): State<Arc<Node>>) -> impl IntoResponse {
    match node.connection_status().await {
        Ok(peers) => {
            let mut body = String::new();
            for peer in peers {
                let _ = writeln!(body, "{} {}", peer.node_id, peer.address);
            }
            (StatusCode::OK, body)
        }
        Err(err) => (StatusCode::SERVICE_UNAVAILABLE, format!("{err:#}\n")),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::{Request, header};
    use tealfs_rs::NodeConfig;
    use tower::ServiceExt;

    use super::*;

    fn form_put(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(resp: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn add_disk_then_status() {
        let dir = tempfile::TempDir::new().unwrap();
        let node = Arc::new(
            Node::start(NodeConfig::new(dir.path().join("cfg"), "127.0.0.1:0"))
                .await
                .unwrap(),
        );
        let app = router(node.clone());

        let disk = dir.path().join("disk one");
        let body = format!("diskPath={}", disk.display()).replace(' ', "+");
        let resp = app.clone().oneshot(form_put("/add-disk", &body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(disk.is_dir());

        let resp = app
            .clone()
            .oneshot(form_put("/add-disk", "diskPath="))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/connection-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_text(resp).await, "");

        node.shutdown().await;
    }
}
