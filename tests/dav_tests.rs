use futures_util::StreamExt;
use http::{Request, Response, StatusCode};
use tempfile::TempDir;

use chezdav::body::Body;
use chezdav::localfs::LocalFs;
use chezdav::locks::LockManager;
use chezdav::virtualfs::VirtualFs;
use chezdav::DavHandler;

fn setup() -> (TempDir, DavHandler) {
    let dir = tempfile::tempdir().unwrap();
    let handler = DavHandler::builder()
        .filesystem(LocalFs::new(dir.path(), true))
        .locksystem(LockManager::new())
        .build_handler();
    (dir, handler)
}

async fn body_string(mut resp: Response<Body>) -> String {
    let mut data = Vec::new();
    let body = resp.body_mut();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.expect("error reading body stream"));
    }
    String::from_utf8_lossy(&data).into_owned()
}

fn req(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_get_root_listing() {
    let (_dir, server) = setup();

    let resp = server.handle(req("GET", "/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let text = body_string(resp).await;
    assert!(text.starts_with("<html>"));
    assert!(text.contains("<title>Index of /</title>"));
    assert!(text.ends_with("</html>"));
}

#[tokio::test]
async fn test_dirlist_sorted_with_slash() {
    let (dir, server) = setup();
    std::fs::create_dir(dir.path().join("bdir")).unwrap();
    std::fs::write(dir.path().join("afile"), b"x").unwrap();
    std::fs::write(dir.path().join("zfile"), b"x").unwrap();

    let text = body_string(server.handle(req("GET", "/")).await).await;
    let a = text.find(">afile<").expect("afile missing");
    let b = text.find(">bdir/<").expect("bdir/ missing");
    let z = text.find(">zfile<").expect("zfile missing");
    assert!(a < b && b < z);
}

#[tokio::test]
async fn test_put_then_get_roundtrip() {
    let (_dir, server) = setup();

    let put = Request::builder()
        .method("PUT")
        .uri("/test-put.txt")
        .body(Body::from("test_put: test data"))
        .unwrap();
    let resp = server.handle(put).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = server.handle(req("GET", "/test-put.txt")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
    assert!(resp.headers().contains_key("etag"));
    assert_eq!(body_string(resp).await, "test_put: test data");

    // overwriting reports 200, not 201.
    let put = Request::builder()
        .method("PUT")
        .uri("/test-put.txt")
        .body(Body::from("new data"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_get_missing_is_404() {
    let (_dir, server) = setup();
    let resp = server.handle(req("GET", "/no-such-file")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_propfind_reports_content_length() {
    let (_dir, server) = setup();

    let put = Request::builder()
        .method("PUT")
        .uri("/x")
        .body(Body::from("0123456789"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::CREATED);

    let propfind = Request::builder()
        .method("PROPFIND")
        .uri("/x")
        .header("Depth", "0")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(propfind).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = body_string(resp).await;
    assert!(text.contains("multistatus"));
    assert!(text.contains(">10<"));
    assert!(text.contains("getcontentlength"));
}

#[tokio::test]
async fn test_propfind_depth_infinity_forbidden() {
    let (_dir, server) = setup();
    let propfind = Request::builder()
        .method("PROPFIND")
        .uri("/")
        .header("Depth", "infinity")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(propfind).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let text = body_string(resp).await;
    assert!(text.contains("propfind-finite-depth"));
}

#[tokio::test]
async fn test_propfind_depth_one_lists_children() {
    let (dir, server) = setup();
    std::fs::write(dir.path().join("child.txt"), b"hi").unwrap();

    let propfind = Request::builder()
        .method("PROPFIND")
        .uri("/")
        .header("Depth", "1")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(propfind).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = body_string(resp).await;
    assert!(text.contains("child.txt"));
    assert!(text.contains("collection"));
}

#[tokio::test]
async fn test_mkcol_delete_idempotence() {
    let (_dir, server) = setup();

    assert_eq!(server.handle(req("MKCOL", "/A")).await.status(), StatusCode::CREATED);
    assert_eq!(
        server.handle(req("MKCOL", "/A")).await.status(),
        StatusCode::METHOD_NOT_ALLOWED
    );
    assert_eq!(
        server.handle(req("MKCOL", "/no/parent")).await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        server.handle(req("DELETE", "/A")).await.status(),
        StatusCode::NO_CONTENT
    );
    assert_eq!(
        server.handle(req("DELETE", "/A")).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn test_mkcol_with_body_unsupported() {
    let (_dir, server) = setup();
    let mkcol = Request::builder()
        .method("MKCOL")
        .uri("/B")
        .body(Body::from("<nonsense/>"))
        .unwrap();
    assert_eq!(
        server.handle(mkcol).await.status(),
        StatusCode::UNSUPPORTED_MEDIA_TYPE
    );
}

#[tokio::test]
async fn test_delete_collection_recursive() {
    let (dir, server) = setup();
    std::fs::create_dir_all(dir.path().join("tree/sub")).unwrap();
    std::fs::write(dir.path().join("tree/sub/file"), b"x").unwrap();

    assert_eq!(
        server.handle(req("DELETE", "/tree")).await.status(),
        StatusCode::NO_CONTENT
    );
    assert!(!dir.path().join("tree").exists());
}

#[tokio::test]
async fn test_copy_and_move() {
    let (dir, server) = setup();
    std::fs::write(dir.path().join("test.txt"), b"copy me").unwrap();

    let copy = Request::builder()
        .method("COPY")
        .uri("/test.txt")
        .header("Destination", "/test-copy.txt")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(copy).await.status(), StatusCode::CREATED);
    assert_eq!(
        body_string(server.handle(req("GET", "/test-copy.txt")).await).await,
        "copy me"
    );

    // copying over an existing destination reports 204.
    let copy = Request::builder()
        .method("COPY")
        .uri("/test.txt")
        .header("Destination", "/test-copy.txt")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(copy).await.status(), StatusCode::NO_CONTENT);

    // Overwrite: F forbids it.
    let copy = Request::builder()
        .method("COPY")
        .uri("/test.txt")
        .header("Destination", "/test-copy.txt")
        .header("Overwrite", "F")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        server.handle(copy).await.status(),
        StatusCode::PRECONDITION_FAILED
    );

    let mv = Request::builder()
        .method("MOVE")
        .uri("/test-copy.txt")
        .header("Destination", "/moved.txt")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(mv).await.status(), StatusCode::CREATED);
    assert_eq!(
        server.handle(req("GET", "/test-copy.txt")).await.status(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        server.handle(req("GET", "/moved.txt")).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_copy_directory_recursive() {
    let (dir, server) = setup();
    std::fs::create_dir_all(dir.path().join("src/sub")).unwrap();
    std::fs::write(dir.path().join("src/sub/file"), b"deep").unwrap();

    let copy = Request::builder()
        .method("COPY")
        .uri("/src")
        .header("Destination", "/dst")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(copy).await.status(), StatusCode::CREATED);
    assert_eq!(
        std::fs::read(dir.path().join("dst/sub/file")).unwrap(),
        b"deep"
    );
}

#[tokio::test]
async fn test_copy_from_virtual_source_forbidden() {
    let server = DavHandler::builder()
        .filesystem(VirtualFs::builder().dir("/virtual").build())
        .locksystem(LockManager::new())
        .build_handler();

    let copy = Request::builder()
        .method("COPY")
        .uri("/virtual")
        .header("Destination", "/virtual-copy")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(copy).await.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_put_to_virtual_dir_is_500() {
    let server = DavHandler::builder()
        .filesystem(VirtualFs::builder().dir("/virtual").build())
        .locksystem(LockManager::new())
        .build_handler();

    let put = Request::builder()
        .method("PUT")
        .uri("/virtual")
        .body(Body::from("data"))
        .unwrap();
    assert_eq!(
        server.handle(put).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[tokio::test]
async fn test_virtual_listing_includes_real_children() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("inside.txt"), b"shared").unwrap();
    let server = DavHandler::builder()
        .filesystem(
            VirtualFs::builder()
                .dir("/virtual")
                .bind("/share", dir.path())
                .build(),
        )
        .locksystem(LockManager::new())
        .build_handler();

    let text = body_string(server.handle(req("GET", "/")).await).await;
    assert!(text.contains("virtual"));
    assert!(text.contains("share"));

    // a real file reached through the overlay.
    let resp = server.handle(req("GET", "/share/inside.txt")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_string(resp).await, "shared");
}

fn lock_body(scope: &str) -> Body {
    let xml = concat!(
        r#"<?xml version="1.0" encoding="utf-8" ?>"#,
        r#"<D:lockinfo xmlns:D="DAV:">"#,
        r#"<D:lockscope><D:SCOPE/></D:lockscope>"#,
        r#"<D:locktype><D:write/></D:locktype>"#,
        r#"<D:owner><D:href>chezdav-test</D:href></D:owner>"#,
        r#"</D:lockinfo>"#
    )
    .replace("SCOPE", scope);
    Body::from(xml)
}

#[tokio::test]
async fn test_lock_put_unlock_flow() {
    let (_dir, server) = setup();

    // LOCK on an unmapped URL creates an empty file.
    let lock = Request::builder()
        .method("LOCK")
        .uri("/locked.txt")
        .body(lock_body("exclusive"))
        .unwrap();
    let resp = server.handle(lock).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let token = resp
        .headers()
        .get("lock-token")
        .expect("no Lock-Token header")
        .to_str()
        .unwrap()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string();
    assert!(token.starts_with("urn:uuid:"));
    let text = body_string(resp).await;
    assert!(text.contains("lockdiscovery"));
    assert!(text.contains("activelock"));
    assert!(text.contains(&token));

    // PUT without the token is refused.
    let put = Request::builder()
        .method("PUT")
        .uri("/locked.txt")
        .body(Body::from("denied"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::LOCKED);

    // PUT with the token in an If header goes through; the resource
    // exists now, so the status is 200.
    let put = Request::builder()
        .method("PUT")
        .uri("/locked.txt")
        .header("If", format!("(<{}>)", token))
        .body(Body::from("allowed"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::OK);

    // UNLOCK with a bogus token is a conflict.
    let unlock = Request::builder()
        .method("UNLOCK")
        .uri("/locked.txt")
        .header("Lock-Token", "<urn:uuid:00000000-0000-0000-0000-000000000000>")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(unlock).await.status(), StatusCode::CONFLICT);

    let unlock = Request::builder()
        .method("UNLOCK")
        .uri("/locked.txt")
        .header("Lock-Token", format!("<{}>", token))
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(unlock).await.status(), StatusCode::NO_CONTENT);

    // and now the file is writable again.
    let put = Request::builder()
        .method("PUT")
        .uri("/locked.txt")
        .body(Body::from("unlocked"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_lock_refresh() {
    let (_dir, server) = setup();

    let lock = Request::builder()
        .method("LOCK")
        .uri("/refresh.txt")
        .header("Timeout", "Second-3600")
        .body(lock_body("exclusive"))
        .unwrap();
    let resp = server.handle(lock).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let token = resp
        .headers()
        .get("lock-token")
        .unwrap()
        .to_str()
        .unwrap()
        .trim_matches(|c| c == '<' || c == '>')
        .to_string();

    // empty body + If header refreshes.
    let refresh = Request::builder()
        .method("LOCK")
        .uri("/refresh.txt")
        .header("If", format!("(<{}>)", token))
        .header("Timeout", "Second-60")
        .body(Body::empty())
        .unwrap();
    let resp = server.handle(refresh).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body_string(resp).await.contains("Second-"));

    // refreshing an unknown token is a bad request.
    let refresh = Request::builder()
        .method("LOCK")
        .uri("/refresh.txt")
        .header("If", "(<urn:uuid:00000000-0000-0000-0000-000000000000>)")
        .body(Body::empty())
        .unwrap();
    assert_eq!(server.handle(refresh).await.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_lock_conflict_is_423() {
    let (_dir, server) = setup();

    let lock = Request::builder()
        .method("LOCK")
        .uri("/busy")
        .body(lock_body("exclusive"))
        .unwrap();
    assert_eq!(server.handle(lock).await.status(), StatusCode::CREATED);

    // a second exclusive lock under it is refused. Without an If header
    // the conditional check already reports the conflict.
    let lock = Request::builder()
        .method("LOCK")
        .uri("/busy")
        .body(lock_body("exclusive"))
        .unwrap();
    assert_eq!(server.handle(lock).await.status(), StatusCode::LOCKED);
}

#[tokio::test]
async fn test_readonly_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f"), b"x").unwrap();
    let server = DavHandler::builder()
        .filesystem(LocalFs::new(dir.path(), true))
        .locksystem(LockManager::new())
        .readonly(true)
        .build_handler();

    let put = Request::builder()
        .method("PUT")
        .uri("/f")
        .body(Body::from("nope"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        server.handle(req("MKCOL", "/d")).await.status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(
        server.handle(req("DELETE", "/f")).await.status(),
        StatusCode::FORBIDDEN
    );
    // reads still work.
    assert_eq!(server.handle(req("GET", "/f")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_options() {
    let (_dir, server) = setup();
    let resp = server.handle(req("OPTIONS", "/")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("dav").unwrap(), "1,2");
    assert_eq!(resp.headers().get("ms-author-via").unwrap(), "DAV");
    let allow = resp.headers().get("allow").unwrap().to_str().unwrap();
    assert!(allow.contains("PROPFIND"));
    assert!(allow.contains("LOCK"));
}

#[tokio::test]
async fn test_proppatch_dead_property() {
    let (_dir, server) = setup();

    let put = Request::builder()
        .method("PUT")
        .uri("/propped")
        .body(Body::from("x"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::CREATED);

    let body = concat!(
        r#"<?xml version="1.0" encoding="utf-8" ?>"#,
        r#"<D:propertyupdate xmlns:D="DAV:" xmlns:Z="urn:example:"><D:set>"#,
        r#"<D:prop><Z:color>blue</Z:color></D:prop>"#,
        r#"</D:set></D:propertyupdate>"#
    );
    let patch = Request::builder()
        .method("PROPPATCH")
        .uri("/propped")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(patch).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = body_string(resp).await;
    assert!(text.contains("color"));
}

#[tokio::test]
async fn test_proppatch_live_property_forbidden() {
    let (_dir, server) = setup();

    let put = Request::builder()
        .method("PUT")
        .uri("/live")
        .body(Body::from("x"))
        .unwrap();
    assert_eq!(server.handle(put).await.status(), StatusCode::CREATED);

    let body = concat!(
        r#"<?xml version="1.0" encoding="utf-8" ?>"#,
        r#"<D:propertyupdate xmlns:D="DAV:"><D:set>"#,
        r#"<D:prop><D:getetag>fake</D:getetag></D:prop>"#,
        r#"</D:set></D:propertyupdate>"#
    );
    let patch = Request::builder()
        .method("PROPPATCH")
        .uri("/live")
        .body(Body::from(body))
        .unwrap();
    let resp = server.handle(patch).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let text = body_string(resp).await;
    assert!(text.contains("403"));
}
