//! Fake WPS endpoints and fixtures shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use tempfile::NamedTempFile;

use crate::db::Store;

pub const EXCEPTION_REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ows:ExceptionReport xmlns:ows="http://www.opengis.net/ows/1.1" version="1.0.0">
  <ows:Exception exceptionCode="InvalidParameterValue" locator="Identifier">
    <ows:ExceptionText>Process does not exist</ows:ExceptionText>
  </ows:Exception>
</ows:ExceptionReport>"#;

pub const EXECUTE_RESPONSE: &str = r#"<wps:ExecuteResponse xmlns:wps="http://www.opengis.net/wps/1.0.0">
  <wps:Status><wps:ProcessSucceeded>done</wps:ProcessSucceeded></wps:Status>
</wps:ExecuteResponse>"#;

/// A throwaway store. Keep the returned file alive for the duration of the test.
pub fn temp_store() -> (NamedTempFile, Arc<Store>) {
    let tmp = NamedTempFile::new().unwrap();
    let store = Arc::new(Store::new(tmp.path()).unwrap());
    (tmp, store)
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/wps", addr)
}

/// An endpoint answering every POST with the same status and body.
pub async fn spawn_endpoint(status: StatusCode, body: &'static str) -> String {
    serve(Router::new().route("/wps", post(move || async move { (status, body) }))).await
}

/// An endpoint that never answers within any reasonable probe timeout.
pub async fn spawn_hanging_endpoint() -> String {
    serve(Router::new().route(
        "/wps",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            "too late"
        }),
    ))
    .await
}

/// An endpoint replaying `replies` in order, repeating the last one.
pub async fn spawn_sequence_endpoint(replies: Vec<(StatusCode, &'static str)>) -> String {
    let replies = Arc::new(replies);
    let calls = Arc::new(AtomicUsize::new(0));
    serve(Router::new().route(
        "/wps",
        post(move || {
            let replies = replies.clone();
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                replies[n.min(replies.len() - 1)]
            }
        }),
    ))
    .await
}
