use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header::USER_AGENT};
use axum::response::IntoResponse;
use axum::routing::get;
use librfs::{ControlFile, OpenMode, Resolver, RfsConfig, RfsError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use webrfs::{HttpBackend, Scheme};

/// Local test server: `GET /missing*` answers 404, other GETs echo the path
/// and user agent, POSTs echo the body.
async fn spawn_server() -> SocketAddr {
    let router = Router::new().route("/{*path}", get(page).post(posted));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });
    addr
}

async fn page(Path(path): Path<String>, headers: HeaderMap) -> impl IntoResponse {
    if path.starts_with("missing") {
        return (StatusCode::NOT_FOUND, "nope".to_string());
    }
    let agent = headers
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    (StatusCode::OK, format!("page /{path} {agent}"))
}

async fn posted(body: Bytes) -> Vec<u8> {
    [b"posted:".as_slice(), &body[..]].concat()
}

async fn read_all(resolver: &Resolver, raw: &str, pid: u32) -> librfs::Result<Vec<u8>> {
    let path = resolver.lookup(raw).await;
    let handle = resolver.open(&path, pid, OpenMode::READ_ONLY).await?;
    Ok(resolver.read(&handle, 0, u32::MAX).to_vec())
}

fn setup() -> (Arc<HttpBackend>, Resolver) {
    let backend = Arc::new(HttpBackend::new(Scheme::Http));
    let resolver = Resolver::new(backend.clone(), &RfsConfig::default());
    (backend, resolver)
}

#[tokio::test]
async fn test_get_through_resolver() {
    let addr = spawn_server().await;
    let (_, resolver) = setup();

    let contents = read_all(&resolver, &format!("{addr}/hello:"), 1).await.unwrap();
    assert_eq!(
        String::from_utf8(contents).unwrap(),
        format!("page /hello {}", webrfs::http::DEFAULT_USER_AGENT)
    );

    let explicit = read_all(&resolver, &format!(":http/{addr}/hello:"), 1).await.unwrap();
    assert!(explicit.starts_with(b"page /hello"));
}

#[tokio::test]
async fn test_http_errors_fail_the_entry() {
    let addr = spawn_server().await;
    let (_, resolver) = setup();

    let path = resolver.lookup(&format!("{addr}/missing:")).await;
    let err = resolver.stat(&path, 1).await.unwrap_err();
    let RfsError::AlreadyFailed { source, .. } = &err else {
        panic!("unexpected error {err:?}");
    };
    assert!(source.to_string().contains("404"), "{source}");
    assert_eq!(err.errno(), libc::EIO);

    let path = resolver.lookup(&format!(":gopher/{addr}/x:")).await;
    let err = resolver.stat(&path, 1).await.unwrap_err();
    assert!(err.to_string().contains("unknown modifier"), "{err}");
}

#[tokio::test]
async fn test_post_result_visible_to_writer() {
    let addr = spawn_server().await;
    let (_, resolver) = setup();
    let raw = format!("{addr}/form:");

    let path = resolver.lookup(&raw).await;
    let mut handle = resolver
        .open(&path, 42, OpenMode::from_flags(libc::O_WRONLY as u32))
        .await
        .unwrap();
    resolver.write(&mut handle, 0, b"name=rfs").unwrap();
    assert!(resolver.commit_write(&mut handle, 42).await.unwrap());

    assert_eq!(read_all(&resolver, &raw, 42).await.unwrap(), b"posted:name=rfs");
    assert!(read_all(&resolver, &raw, 43).await.unwrap().starts_with(b"page /form"));
}

#[tokio::test]
async fn test_user_agent_control_file() {
    let addr = spawn_server().await;
    let (backend, resolver) = setup();

    backend.user_agent_file().write(b"tester/1.0\n").await.unwrap();
    let contents = read_all(&resolver, &format!("{addr}/ua:"), 1).await.unwrap();
    assert_eq!(contents, b"page /ua tester/1.0");
}
