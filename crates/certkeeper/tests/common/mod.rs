//! Common test utilities for integration tests
//!
//! RSA keys, self-signed provider certificates, token minting, a wiremock key
//! endpoint, and a scripted [`KeyDocumentSource`] for driving the scheduler
//! without a network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use certkeeper::{KeyDocument, KeyDocumentSource, RefreshError};
use http::{HeaderMap, HeaderValue, StatusCode};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::time::Instant;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

/// An RSA signing key and the self-signed certificate the provider would publish for it
pub struct TestKey {
    pub private_pem: String,
    pub certificate_pem: String,
}

/// Two independent signing keys, generated once per test binary
pub fn test_keys() -> &'static [TestKey; 2] {
    static KEYS: OnceLock<[TestKey; 2]> = OnceLock::new();
    KEYS.get_or_init(|| [generate_test_key("alpha"), generate_test_key("beta")])
}

pub fn key_a() -> &'static TestKey {
    &test_keys()[0]
}

pub fn key_b() -> &'static TestKey {
    &test_keys()[1]
}

fn generate_test_key(name: &str) -> TestKey {
    use rsa::RsaPrivateKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("Failed to generate RSA key");
    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .expect("Failed to encode private key")
        .to_string();

    let key_pair = rcgen::KeyPair::from_pem(&private_pem).expect("rcgen rejected RSA key");
    let params = rcgen::CertificateParams::new(vec![format!("{name}.securetoken.test")])
        .expect("Invalid certificate params");
    let certificate = params
        .self_signed(&key_pair)
        .expect("Failed to self-sign certificate");

    TestKey {
        private_pem,
        certificate_pem: certificate.pem(),
    }
}

/// Self-signed certificate carrying a P-256 key
pub fn ec_certificate_pem() -> String {
    let certified = rcgen::generate_simple_self_signed(vec!["ec.securetoken.test".to_string()])
        .expect("Failed to generate EC certificate");
    certified.cert.pem()
}

/// `{ kid: certificate }` document body
pub fn key_document(entries: &[(&str, &TestKey)]) -> Value {
    let mut document = serde_json::Map::new();
    for (kid, key) in entries {
        document.insert(
            (*kid).to_string(),
            Value::String(key.certificate_pem.clone()),
        );
    }
    Value::Object(document)
}

/// Claims a provider would put in an ID token
pub fn id_token_claims(sub: &str) -> Value {
    json!({
        "iss": "https://securetoken.test/project",
        "aud": "project",
        "sub": sub,
        "iat": 1_700_000_000u64,
        "exp": 1_700_003_600u64,
        "email_verified": true,
        "firebase": { "sign_in_provider": "password" },
    })
}

/// Sign `claims` with `key`, naming `kid` in the header
pub fn mint_token(key: &TestKey, kid: &str, algorithm: Algorithm, claims: &Value) -> String {
    let encoding_key =
        EncodingKey::from_rsa_pem(key.private_pem.as_bytes()).expect("Invalid RSA key");
    let mut header = Header::new(algorithm);
    header.kid = Some(kid.to_string());
    header.typ = Some("JWT".to_string());
    encode(&header, claims, &encoding_key).expect("Failed to encode test JWT")
}

/// RS256 token, the happy path
pub fn mint_rs256(key: &TestKey, kid: &str, claims: &Value) -> String {
    mint_token(key, kid, Algorithm::RS256, claims)
}

/// Headers a well-behaved key endpoint sends
pub fn freshness_headers(age: u64, max_age: u64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(http::header::AGE, HeaderValue::from(age));
    headers.insert(
        http::header::CACHE_CONTROL,
        HeaderValue::from_str(&format!(
            "public, max-age={max_age}, must-revalidate, no-transform"
        ))
        .expect("valid header"),
    );
    headers
}

/// A 200 response carrying `document`
pub fn ok_document(document: &Value, age: u64, max_age: u64) -> KeyDocument {
    KeyDocument {
        status: StatusCode::OK,
        headers: freshness_headers(age, max_age),
        body: Bytes::from(document.to_string()),
    }
}

/// Serve `document` from `GET /certs` with freshness headers
pub async fn mount_key_document(server: &MockServer, document: &Value, age: u64, max_age: u64) {
    Mock::given(method("GET"))
        .and(path("/certs"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Age", age.to_string().as_str())
                .insert_header(
                    "Cache-Control",
                    format!("public, max-age={max_age}, must-revalidate, no-transform").as_str(),
                )
                .set_body_json(document),
        )
        .mount(server)
        .await;
}

/// One scripted reply of a [`ScriptedSource`]
#[derive(Clone)]
pub enum Reply {
    Document(KeyDocument),
    TransportError(&'static str),
}

/// Replays a script of replies and records when each fetch happened
///
/// The last reply repeats once the script runs out.
pub struct ScriptedSource {
    replies: Mutex<VecDeque<Reply>>,
    fetches: Mutex<Vec<Instant>>,
}

impl ScriptedSource {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        let replies: VecDeque<Reply> = replies.into_iter().collect();
        assert!(!replies.is_empty(), "script needs at least one reply");
        Self {
            replies: Mutex::new(replies),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::new([Reply::TransportError("connection refused")])
    }

    /// Instants (tokio clock) of every fetch so far
    pub fn fetch_times(&self) -> Vec<Instant> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap().len()
    }
}

#[async_trait]
impl KeyDocumentSource for ScriptedSource {
    async fn fetch(&self) -> Result<KeyDocument, RefreshError> {
        self.fetches.lock().unwrap().push(Instant::now());

        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        };

        match reply {
            Reply::Document(document) => Ok(document),
            Reply::TransportError(message) => Err(RefreshError::Transport(message.to_string())),
        }
    }

    fn describe(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_document_shape() {
        let document = key_document(&[("kid-1", key_a())]);
        let pem = document["kid-1"].as_str().unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_freshness_headers() {
        let headers = freshness_headers(2, 3600);
        assert_eq!(headers["age"], "2");
        assert!(
            headers["cache-control"]
                .to_str()
                .unwrap()
                .contains("max-age=3600")
        );
    }
}
