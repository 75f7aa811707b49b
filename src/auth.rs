//! HTTP authentication: Basic and Digest (RFC 2617, MD5, qop=auth).
//!
//! A [`DomainController`] resolves a request to a realm (by default the
//! share path) and answers credential questions. The authenticator
//! produces either a principal or a challenge response; it keeps a
//! nonce cache and rejects nonce-count replays.
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use headers::authorization::Basic;
use headers::{Authorization, HeaderMapExt};
use http::{Request, Response, StatusCode};
use log::{debug, trace};
use uuid::Uuid;

use crate::body::Body;

const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Maps realms to users, answers credential questions.
pub trait DomainController: Debug + Send + Sync {
    /// Resolve a share path to a realm name.
    fn get_domain_realm(&self, path: &str) -> String {
        if path.is_empty() {
            "/".to_string()
        } else {
            path.to_string()
        }
    }

    /// Does this realm require authentication at all?
    fn require_authentication(&self, realm: &str) -> bool;

    /// Is this a known user in the realm?
    fn is_realm_user(&self, realm: &str, user: &str) -> bool;

    /// The user's password, needed for Digest authentication.
    fn get_realm_user_password(&self, realm: &str, user: &str) -> Option<String>;

    /// Validate a username/password pair (Basic authentication).
    fn auth_domain_user(&self, realm: &str, user: &str, password: &str) -> bool {
        self.get_realm_user_password(realm, user)
            .map(|p| p == password)
            .unwrap_or(false)
    }
}

/// Domain controller backed by the `user_mapping` from the config
/// file: realm -> user -> password.
#[derive(Debug, Clone, Default)]
pub struct SimpleDomainController {
    users: HashMap<String, HashMap<String, String>>,
}

impl SimpleDomainController {
    pub fn new(users: HashMap<String, HashMap<String, String>>) -> SimpleDomainController {
        SimpleDomainController { users }
    }
}

impl DomainController for SimpleDomainController {
    fn require_authentication(&self, realm: &str) -> bool {
        self.users.contains_key(realm)
    }

    fn is_realm_user(&self, realm: &str, user: &str) -> bool {
        self.users.get(realm).map(|u| u.contains_key(user)).unwrap_or(false)
    }

    fn get_realm_user_password(&self, realm: &str, user: &str) -> Option<String> {
        self.users.get(realm).and_then(|u| u.get(user)).cloned()
    }
}

/// Outcome of an authentication attempt.
pub enum AuthOutcome {
    /// The realm does not require authentication.
    Anonymous,
    /// Authenticated.
    User { realm: String, username: String },
    /// Not authenticated; send this challenge.
    Challenge(Box<Response<Body>>),
}

#[derive(Debug)]
struct NonceEntry {
    created: SystemTime,
    last_nc: u32,
}

/// Authenticator middleware state.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    dc:             Arc<dyn DomainController>,
    accept_basic:   bool,
    accept_digest:  bool,
    default_digest: bool,
    nonces:         Arc<Mutex<HashMap<String, NonceEntry>>>,
}

impl HttpAuthenticator {
    pub fn new(
        dc: Arc<dyn DomainController>,
        accept_basic: bool,
        accept_digest: bool,
        default_digest: bool,
    ) -> HttpAuthenticator
    {
        HttpAuthenticator {
            dc,
            accept_basic,
            accept_digest,
            default_digest,
            nonces: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Authenticate a request against the realm of the matched share.
    pub fn authenticate<B>(&self, req: &Request<B>, share_path: &str) -> AuthOutcome {
        let realm = self.dc.get_domain_realm(share_path);
        if !self.dc.require_authentication(&realm) {
            return AuthOutcome::Anonymous;
        }

        let authdata = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        match authdata {
            Some(h) if h.len() > 7 && h[..7].eq_ignore_ascii_case("digest ") && self.accept_digest => {
                match self.check_digest(req, &realm, &h[7..]) {
                    Ok(username) => {
                        AuthOutcome::User {
                            realm,
                            username,
                        }
                    },
                    Err(stale) => self.challenge(&realm, stale),
                }
            },
            Some(_) if self.accept_basic => {
                match req.headers().typed_get::<Authorization<Basic>>() {
                    Some(Authorization(basic))
                        if self.dc.auth_domain_user(&realm, basic.username(), basic.password()) =>
                    {
                        AuthOutcome::User {
                            realm,
                            username: basic.username().to_string(),
                        }
                    },
                    _ => {
                        debug!("authenticate: basic auth failed for realm {}", realm);
                        self.challenge(&realm, false)
                    },
                }
            },
            _ => self.challenge(&realm, false),
        }
    }

    // returns the username, or Err(stale).
    fn check_digest<B>(&self, req: &Request<B>, realm: &str, fields: &str) -> Result<String, bool> {
        let f = parse_kv(fields);
        let username = f.get("username").ok_or(false)?;
        let nonce = f.get("nonce").ok_or(false)?;
        let uri = f.get("uri").ok_or(false)?;
        let response = f.get("response").ok_or(false)?;

        if f.get("realm").map(|r| r.as_str() != realm).unwrap_or(true) {
            debug!("check_digest: realm mismatch for user {}", username);
            return Err(false);
        }
        if !self.dc.is_realm_user(realm, username) {
            return Err(false);
        }
        let password = self.dc.get_realm_user_password(realm, username).ok_or(false)?;

        // qop=auth requires cnonce and nc.
        let qop = f.get("qop").map(|s| s.as_str());
        let (cnonce, nc) = match qop {
            Some("auth") => {
                let cnonce = f.get("cnonce").ok_or(false)?;
                let nc = f.get("nc").ok_or(false)?;
                (Some(cnonce), Some(nc))
            },
            None => (None, None),
            _ => return Err(false),
        };

        // the nonce must be one we issued, and still fresh.
        {
            let mut nonces = self.nonces.lock().unwrap();
            let expired = match nonces.get(nonce.as_str()) {
                None => {
                    trace!("check_digest: unknown nonce");
                    return Err(true);
                },
                Some(e) => e.created.elapsed().unwrap_or(NONCE_LIFETIME) >= NONCE_LIFETIME,
            };
            if expired {
                trace!("check_digest: stale nonce");
                nonces.remove(nonce.as_str());
                return Err(true);
            }
            // protect against nonce-count replay.
            if let Some(nc) = nc {
                let nc = u32::from_str_radix(nc, 16).map_err(|_| false)?;
                let entry = nonces.get_mut(nonce.as_str()).unwrap();
                if nc <= entry.last_nc {
                    debug!("check_digest: nonce-count replay (nc={:08x})", nc);
                    return Err(false);
                }
                entry.last_nc = nc;
            }
        }

        let ha1 = md5hex(format!("{}:{}:{}", username, realm, password));
        let ha2 = md5hex(format!("{}:{}", req.method().as_str(), uri));
        let expected = match (qop, cnonce, nc) {
            (Some("auth"), Some(cnonce), Some(nc)) => {
                md5hex(format!("{}:{}:{}:{}:auth:{}", ha1, nonce, nc, cnonce, ha2))
            },
            _ => md5hex(format!("{}:{}:{}", ha1, nonce, ha2)),
        };

        if &expected == response {
            Ok(username.to_string())
        } else {
            debug!("check_digest: bad response for user {}", username);
            Err(false)
        }
    }

    fn challenge(&self, realm: &str, stale: bool) -> AuthOutcome {
        let mut resp = Response::builder().status(StatusCode::UNAUTHORIZED);

        let mut schemes = Vec::new();
        if self.accept_digest {
            let nonce = self.new_nonce();
            let stale = if stale { ", stale=true" } else { "" };
            schemes.push((
                self.default_digest,
                format!(
                    "Digest realm=\"{}\", qop=\"auth\", nonce=\"{}\", opaque=\"{}\"{}",
                    realm,
                    nonce,
                    md5hex(realm),
                    stale
                ),
            ));
        }
        if self.accept_basic {
            schemes.push((!self.default_digest, format!("Basic realm=\"{}\"", realm)));
        }
        // preferred scheme first.
        schemes.sort_by_key(|(preferred, _)| !*preferred);
        for (_, challenge) in schemes {
            resp = resp.header(http::header::WWW_AUTHENTICATE, challenge);
        }

        let resp = resp
            .header("content-length", "0")
            .body(Body::empty())
            .unwrap();
        AuthOutcome::Challenge(Box::new(resp))
    }

    fn new_nonce(&self) -> String {
        let nonce = md5hex(format!("{}{:?}", Uuid::new_v4(), SystemTime::now()));
        let mut nonces = self.nonces.lock().unwrap();
        // opportunistic cleanup of expired nonces.
        nonces.retain(|_, e| e.created.elapsed().unwrap_or(NONCE_LIFETIME) < NONCE_LIFETIME);
        nonces.insert(
            nonce.clone(),
            NonceEntry {
                created: SystemTime::now(),
                last_nc: 0,
            },
        );
        nonce
    }
}

fn md5hex(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", md5::compute(data.as_ref()))
}

// parse the comma separated key="value" fields of a Digest header.
fn parse_kv(fields: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut rest = fields.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(i) => i,
            None => break,
        };
        let key = rest[..eq].trim().to_lowercase();
        rest = rest[eq + 1..].trim_start();
        let value;
        if let Some(r) = rest.strip_prefix('"') {
            let end = match r.find('"') {
                Some(i) => i,
                None => break,
            };
            value = r[..end].to_string();
            rest = &r[end + 1..];
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = &rest[end..];
        }
        map.insert(key, value);
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> Arc<dyn DomainController> {
        let mut users = HashMap::new();
        let mut realm = HashMap::new();
        realm.insert("alice".to_string(), "secret".to_string());
        users.insert("/share".to_string(), realm);
        Arc::new(SimpleDomainController::new(users))
    }

    fn issued_nonce(auth: &HttpAuthenticator) -> String {
        match auth.authenticate(&http::Request::new(()), "/share") {
            AuthOutcome::Challenge(resp) => {
                let www = resp
                    .headers()
                    .get(http::header::WWW_AUTHENTICATE)
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string();
                let fields = parse_kv(www.trim_start_matches("Digest "));
                fields.get("nonce").unwrap().clone()
            },
            _ => panic!("expected a challenge"),
        }
    }

    fn digest_request(nonce: &str, nc: &str) -> http::Request<()> {
        let ha1 = md5hex("alice:/share:secret");
        let ha2 = md5hex("GET:/share/x");
        let response = md5hex(format!("{}:{}:{}:deadbeef:auth:{}", ha1, nonce, nc, ha2));
        let value = format!(
            "Digest username=\"alice\", realm=\"/share\", nonce=\"{}\", uri=\"/share/x\", \
             qop=auth, nc={}, cnonce=\"deadbeef\", response=\"{}\"",
            nonce, nc, response
        );
        http::Request::builder()
            .method("GET")
            .uri("/share/x")
            .header("authorization", value)
            .body(())
            .unwrap()
    }

    #[test]
    fn basic_auth() {
        let auth = HttpAuthenticator::new(controller(), true, false, false);
        let req = http::Request::builder()
            .uri("/share/x")
            // "alice:secret"
            .header("authorization", "Basic YWxpY2U6c2VjcmV0")
            .body(())
            .unwrap();
        match auth.authenticate(&req, "/share") {
            AuthOutcome::User { username, realm } => {
                assert_eq!(username, "alice");
                assert_eq!(realm, "/share");
            },
            _ => panic!("expected authenticated user"),
        }
    }

    #[test]
    fn anonymous_realm() {
        let auth = HttpAuthenticator::new(controller(), true, true, true);
        let req = http::Request::builder().uri("/other/x").body(()).unwrap();
        assert!(matches!(auth.authenticate(&req, "/other"), AuthOutcome::Anonymous));
    }

    #[test]
    fn digest_roundtrip_and_replay() {
        let auth = HttpAuthenticator::new(controller(), false, true, true);
        let nonce = issued_nonce(&auth);

        let req = digest_request(&nonce, "00000001");
        match auth.authenticate(&req, "/share") {
            AuthOutcome::User { username, .. } => assert_eq!(username, "alice"),
            _ => panic!("digest auth should succeed"),
        }

        // same nonce-count again: replay, refused.
        let req = digest_request(&nonce, "00000001");
        assert!(matches!(auth.authenticate(&req, "/share"), AuthOutcome::Challenge(_)));

        // incremented nonce-count is fine.
        let nonce = issued_nonce(&auth);
        let req = digest_request(&nonce, "00000001");
        assert!(matches!(auth.authenticate(&req, "/share"), AuthOutcome::User { .. }));
        let req = digest_request(&nonce, "00000002");
        assert!(matches!(auth.authenticate(&req, "/share"), AuthOutcome::User { .. }));
    }
}
