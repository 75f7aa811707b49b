use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use http::{Request, StatusCode};

use davshare::auth::{DomainController, HttpAuthenticator, SimpleDomainController};
use davshare::body::Body;
use davshare::memls::MemLs;
use davshare::propman::MemPm;
use davshare::repofs::RepoFs;
use davshare::DavRouter;

const LOCKINFO_EXCLUSIVE: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<D:lockinfo xmlns:D="DAV:">
  <D:lockscope><D:exclusive/></D:lockscope>
  <D:locktype><D:write/></D:locktype>
  <D:owner><D:href>litmus</D:href></D:owner>
</D:lockinfo>"#;

fn setup() -> DavRouter {
    DavRouter::builder()
        .share("/", RepoFs::new())
        .locksystem(MemLs::new())
        .propsystem(MemPm::new())
        .autoindex(true)
        .build()
}

async fn request(
    router: &DavRouter,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: impl Into<Body>,
) -> http::Response<Body>
{
    let mut builder = Request::builder().method(method).uri(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    let req = builder.body(body.into()).unwrap();
    router.handle(req).await
}

async fn body_string(mut resp: http::Response<Body>) -> String {
    let mut data = Vec::new();
    let body = resp.body_mut();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk.expect("error reading body stream"));
    }
    String::from_utf8(data).unwrap_or_default()
}

fn header(resp: &http::Response<Body>, name: &str) -> String {
    resp.headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
        .unwrap_or_default()
}

#[tokio::test]
async fn put_get_roundtrip() {
    let router = setup();

    let resp = request(&router, "PUT", "/a.txt", &[], "hello").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = header(&resp, "etag");
    assert!(!etag.is_empty());

    let resp = request(&router, "GET", "/a.txt", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "etag"), etag);
    assert_eq!(header(&resp, "content-length"), "5");
    assert_eq!(body_string(resp).await, "hello");
}

#[tokio::test]
async fn put_empty_body() {
    let router = setup();

    let resp = request(&router, "PUT", "/empty", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = request(&router, "GET", "/empty", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "content-length"), "0");
    assert_eq!(body_string(resp).await, "");
}

#[tokio::test]
async fn put_if_match() {
    let router = setup();

    let resp = request(&router, "PUT", "/a.txt", &[], "hello").await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let etag = header(&resp, "etag");

    // wrong etag: nothing changes.
    let resp = request(&router, "PUT", "/a.txt", &[("If-Match", "\"bogus\"")], "x").await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);
    let resp = request(&router, "GET", "/a.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "hello");

    // right etag: overwrite.
    let resp = request(&router, "PUT", "/a.txt", &[("If-Match", etag.as_str())], "x").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let resp = request(&router, "GET", "/a.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "x");
}

#[tokio::test]
async fn get_single_byte_range() {
    let router = setup();
    request(&router, "PUT", "/r.txt", &[], "hello").await;

    let resp = request(&router, "GET", "/r.txt", &[("Range", "bytes=0-0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&resp, "content-range"), "bytes 0-0/5");
    assert_eq!(body_string(resp).await, "h");

    let resp = request(&router, "GET", "/r.txt", &[("Range", "bytes=2-")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_string(resp).await, "llo");

    // unsatisfiable.
    let resp = request(&router, "GET", "/r.txt", &[("Range", "bytes=9-10")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&resp, "content-range"), "bytes */5");
}

#[tokio::test]
async fn options_advertises_locking() {
    let router = setup();
    let resp = request(&router, "OPTIONS", "/", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(header(&resp, "dav"), "1,2");
    assert_eq!(header(&resp, "ms-author-via"), "DAV");
    assert!(header(&resp, "allow").contains("PROPFIND"));
}

#[tokio::test]
async fn mkcol_and_propfind_depth_one() {
    let router = setup();

    let resp = request(&router, "MKCOL", "/X", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // MKCOL on an existing collection.
    let resp = request(&router, "MKCOL", "/X", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    // parent missing.
    let resp = request(&router, "MKCOL", "/no/such", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    // body on MKCOL is not supported.
    let resp = request(&router, "MKCOL", "/Y", &[], "body").await;
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let resp = request(&router, "PROPFIND", "/", &[("Depth", "1")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("/X/"));
    assert!(body.contains("<D:collection"));
}

#[tokio::test]
async fn propfind_depth_zero_single_response() {
    let router = setup();
    request(&router, "MKCOL", "/X", &[], Body::empty()).await;

    let resp = request(&router, "PROPFIND", "/X", &[("Depth", "0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert_eq!(body.matches("<D:response>").count(), 1);
    assert!(body.contains("<D:href>/X/</D:href>"));
}

#[tokio::test]
async fn propfind_infinite_depth_refused() {
    let router = setup();
    let resp = request(&router, "PROPFIND", "/", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body = body_string(resp).await;
    assert!(body.contains("propfind-finite-depth"));
}

#[tokio::test]
async fn proppatch_roundtrip() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;

    let patch = r#"<?xml version="1.0" encoding="utf-8" ?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:E="http://ex/">
          <D:set><D:prop><E:color><E:c>red</E:c></E:color></D:prop></D:set>
        </D:propertyupdate>"#;
    let resp = request(&router, "PROPPATCH", "/a.txt", &[], patch).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("HTTP/1.1 200"));
    assert!(!body.contains("HTTP/1.1 4"));

    let find = r#"<?xml version="1.0" encoding="utf-8" ?>
        <D:propfind xmlns:D="DAV:" xmlns:E="http://ex/">
          <D:prop><E:color/></D:prop>
        </D:propfind>"#;
    let resp = request(&router, "PROPFIND", "/a.txt", &[("Depth", "0")], find).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    // the stored XML subtree comes back unchanged.
    assert!(body.contains(">red<"));
}

#[tokio::test]
async fn proppatch_protected_property() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;

    let patch = r#"<?xml version="1.0" encoding="utf-8" ?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:E="http://ex/">
          <D:set><D:prop><D:getetag>"fake"</D:getetag></D:prop></D:set>
          <D:set><D:prop><E:ok>1</E:ok></D:prop></D:set>
        </D:propertyupdate>"#;
    let resp = request(&router, "PROPPATCH", "/a.txt", &[], patch).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("cannot-modify-protected-property"));
    // the other property in the request must not have been applied.
    assert!(body.contains("HTTP/1.1 424"));
}

#[tokio::test]
async fn exclusive_lock_blocks_foreign_put() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;

    let resp = request(&router, "LOCK", "/a.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let token = header(&resp, "lock-token");
    assert!(token.starts_with("<opaquelocktoken:"));
    let body = body_string(resp).await;
    assert!(body.contains("D:activelock"));
    assert!(body.contains("opaquelocktoken:"));

    // a PUT without the token is refused.
    let resp = request(&router, "PUT", "/a.txt", &[], "x").await;
    assert_eq!(resp.status(), StatusCode::LOCKED);
    let body = body_string(resp).await;
    assert!(body.contains("lock-token-submitted"));
    assert!(body.contains("<D:href>/a.txt</D:href>"));

    // presenting the token makes it work.
    let ifhdr = format!("({})", token);
    let resp = request(&router, "PUT", "/a.txt", &[("If", ifhdr.as_str())], "x").await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // a second exclusive lock is refused.
    let resp = request(&router, "LOCK", "/a.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    assert_eq!(resp.status(), StatusCode::LOCKED);
    let body = body_string(resp).await;
    assert!(body.contains("no-conflicting-lock"));
}

#[tokio::test]
async fn lockdiscovery_after_lock() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;

    let resp = request(&router, "LOCK", "/a.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    let token = header(&resp, "lock-token");
    let token = token.trim_matches(|c| c == '<' || c == '>').to_string();

    let resp = request(&router, "PROPFIND", "/a.txt", &[("Depth", "0")], Body::empty()).await;
    let body = body_string(resp).await;
    assert!(body.contains(&token));
}

#[tokio::test]
async fn lock_null_resource() {
    let router = setup();

    // LOCK on an unmapped URL creates a placeholder.
    let resp = request(&router, "LOCK", "/new.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let token = header(&resp, "lock-token");

    let resp = request(&router, "PROPFIND", "/new.txt", &[("Depth", "0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    // UNLOCK removes the lock and the placeholder.
    let resp = request(&router, "UNLOCK", "/new.txt", &[("Lock-Token", token.as_str())], Body::empty())
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = request(&router, "PROPFIND", "/new.txt", &[("Depth", "0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unlock_without_lock() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;
    let resp = request(
        &router,
        "UNLOCK",
        "/a.txt",
        &[("Lock-Token", "<opaquelocktoken:no-such-token>")],
        Body::empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn lock_unlock_leaves_no_residue() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;

    let resp = request(&router, "LOCK", "/a.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    let token = header(&resp, "lock-token");
    let bare = token.trim_matches(|c| c == '<' || c == '>').to_string();

    let resp = request(&router, "UNLOCK", "/a.txt", &[("Lock-Token", token.as_str())], Body::empty())
        .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = request(&router, "PROPFIND", "/a.txt", &[("Depth", "0")], Body::empty()).await;
    let body = body_string(resp).await;
    assert!(!body.contains(&bare));

    // and the resource is lockable again.
    let resp = request(&router, "LOCK", "/a.txt", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn move_with_overwrite() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "aa").await;
    request(&router, "PUT", "/b.txt", &[], "bb").await;

    let resp = request(
        &router,
        "MOVE",
        "/a.txt",
        &[("Destination", "/b.txt"), ("Overwrite", "F")],
        Body::empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::PRECONDITION_FAILED);

    let resp = request(
        &router,
        "MOVE",
        "/a.txt",
        &[("Destination", "/b.txt"), ("Overwrite", "T")],
        Body::empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let resp = request(&router, "GET", "/a.txt", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = request(&router, "GET", "/b.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "aa");
}

#[tokio::test]
async fn move_to_descendant_refused() {
    let router = setup();
    request(&router, "MKCOL", "/d", &[], Body::empty()).await;
    let resp = request(&router, "MOVE", "/d", &[("Destination", "/d/sub")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn copy_preserves_source() {
    let router = setup();
    request(&router, "MKCOL", "/d", &[], Body::empty()).await;
    request(&router, "PUT", "/d/f.txt", &[], "data").await;

    let resp = request(&router, "COPY", "/d", &[("Destination", "/e")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = request(&router, "GET", "/d/f.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "data");
    let resp = request(&router, "GET", "/e/f.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "data");
}

#[tokio::test]
async fn copy_moves_dead_properties() {
    let router = setup();
    request(&router, "PUT", "/a.txt", &[], "hello").await;
    let patch = r#"<?xml version="1.0" encoding="utf-8" ?>
        <D:propertyupdate xmlns:D="DAV:" xmlns:E="http://ex/">
          <D:set><D:prop><E:color><E:c>red</E:c></E:color></D:prop></D:set>
        </D:propertyupdate>"#;
    request(&router, "PROPPATCH", "/a.txt", &[], patch).await;

    let resp = request(&router, "COPY", "/a.txt", &[("Destination", "/b.txt")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let find = r#"<?xml version="1.0" encoding="utf-8" ?>
        <D:propfind xmlns:D="DAV:" xmlns:E="http://ex/">
          <D:prop><E:color/></D:prop>
        </D:propfind>"#;
    let resp = request(&router, "PROPFIND", "/b.txt", &[("Depth", "0")], find).await;
    let body = body_string(resp).await;
    assert!(body.contains(">red<"));
}

#[tokio::test]
async fn delete_subtree_clears_locks() {
    let router = setup();
    request(&router, "MKCOL", "/d", &[], Body::empty()).await;
    request(&router, "PUT", "/d/x", &[], "xx").await;

    let resp = request(&router, "LOCK", "/d/x", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    let token = header(&resp, "lock-token");
    let bare = token.trim_matches(|c| c == '<' || c == '>').to_string();

    // without the token the delete is refused.
    let resp = request(&router, "DELETE", "/d", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::LOCKED);

    // with the token it goes through, taking the lock with it.
    let ifhdr = format!("({})", token);
    let resp = request(&router, "DELETE", "/d", &[("If", ifhdr.as_str())], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    // the old lock is gone everywhere.
    request(&router, "MKCOL", "/d", &[], Body::empty()).await;
    let resp = request(&router, "LOCK", "/d/x", &[("Depth", "0")], LOCKINFO_EXCLUSIVE).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let newtoken = header(&resp, "lock-token");
    assert_ne!(newtoken, token);
    let resp = request(&router, "PROPFIND", "/d/x", &[("Depth", "0")], Body::empty()).await;
    let body = body_string(resp).await;
    assert!(!body.contains(&bare));
}

#[tokio::test]
async fn delete_collection_depth_zero_refused() {
    let router = setup();
    request(&router, "MKCOL", "/d", &[], Body::empty()).await;
    let resp = request(&router, "DELETE", "/d", &[("Depth", "0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn root_share_lists_mounts() {
    let router = DavRouter::builder()
        .share("/docs", RepoFs::new())
        .share("/media", RepoFs::new())
        .locksystem(MemLs::new())
        .propsystem(MemPm::new())
        .build();

    let resp = request(&router, "PROPFIND", "/", &[("Depth", "1")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
    let body = body_string(resp).await;
    assert!(body.contains("/docs/"));
    assert!(body.contains("/media/"));

    // the synthetic root cannot be written to.
    let resp = request(&router, "PUT", "/f.txt", &[], "x").await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn share_resolution_and_prefixes() {
    let router = DavRouter::builder()
        .share("/docs", RepoFs::new())
        .locksystem(MemLs::new())
        .propsystem(MemPm::new())
        .build();

    let resp = request(&router, "PUT", "/docs/f.txt", &[], "hi").await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    // hrefs in multistatus responses carry the share prefix.
    let resp = request(&router, "PROPFIND", "/docs/f.txt", &[("Depth", "0")], Body::empty()).await;
    let body = body_string(resp).await;
    assert!(body.contains("<D:href>/docs/f.txt</D:href>"));

    // dotdot escapes are refused outright.
    let resp = request(&router, "GET", "/docs/../../etc/passwd", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cross_share_move() {
    let router = DavRouter::builder()
        .share("/a", RepoFs::new())
        .share("/b", RepoFs::new())
        .locksystem(MemLs::new())
        .propsystem(MemPm::new())
        .build();

    request(&router, "PUT", "/a/f.txt", &[], "payload").await;

    let resp = request(&router, "MOVE", "/a/f.txt", &[("Destination", "/b/f.txt")], Body::empty())
        .await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = request(&router, "GET", "/a/f.txt", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let resp = request(&router, "GET", "/b/f.txt", &[], Body::empty()).await;
    assert_eq!(body_string(resp).await, "payload");
}

#[tokio::test]
async fn basic_auth_required() {
    let mut users = HashMap::new();
    let mut realm = HashMap::new();
    realm.insert("alice".to_string(), "secret".to_string());
    users.insert("/".to_string(), realm);
    let dc: Arc<dyn DomainController> = Arc::new(SimpleDomainController::new(users));

    let router = DavRouter::builder()
        .share("/", RepoFs::new())
        .locksystem(MemLs::new())
        .propsystem(MemPm::new())
        .authenticator(HttpAuthenticator::new(dc, true, false, false))
        .build();

    let resp = request(&router, "PROPFIND", "/", &[("Depth", "0")], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(header(&resp, "www-authenticate").starts_with("Basic"));

    // "alice:secret"
    let resp = request(
        &router,
        "PROPFIND",
        "/",
        &[("Depth", "0"), ("Authorization", "Basic YWxpY2U6c2VjcmV0")],
        Body::empty(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
}

#[tokio::test]
async fn unknown_method_not_implemented() {
    let router = setup();
    let resp = request(&router, "PATCH", "/a.txt", &[], Body::empty()).await;
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
}
