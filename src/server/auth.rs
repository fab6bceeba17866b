//! Bearer-token authentication middleware.
//!
//! Resolves `Authorization: Bearer <key>` against the configured API-key
//! table and attaches an [`AuthInfo`] extension. Unknown or absent
//! tokens yield the anonymous identity instead of a 401; access control
//! happens later, per model.

use crate::config::ConfigFile;
use crate::error::ProxyError;
use crate::server::AppState;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use std::sync::RwLock;

/// Identity resolved from an API key. Empty strings mean anonymous.
#[derive(Debug, Clone, Default)]
pub struct AuthInfo {
    pub user: String,
    pub org: String,
}

#[derive(Debug, Default)]
pub struct ApiKeyAuth {
    keys: RwLock<HashMap<String, AuthInfo>>,
}

impl ApiKeyAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the key table. A key shared by two users is a fatal
    /// configuration error.
    pub fn update_from_config(&self, conf: &ConfigFile) -> Result<(), ProxyError> {
        let mut keys = HashMap::new();
        for (org_name, org) in &conf.users {
            for (user, api_key) in &org.api_keys {
                if keys.contains_key(api_key) {
                    return Err(ProxyError::Config(format!(
                        "duplicate api key for user {user} in org {org_name}"
                    )));
                }
                keys.insert(
                    api_key.clone(),
                    AuthInfo {
                        user: user.clone(),
                        org: org_name.clone(),
                    },
                );
            }
        }
        *self.keys.write().expect("auth lock poisoned") = keys;
        Ok(())
    }

    pub fn resolve(&self, token: &str) -> Option<AuthInfo> {
        self.keys
            .read()
            .expect("auth lock poisoned")
            .get(token)
            .cloned()
    }
}

/// Extract the bearer token from an Authorization header value.
fn bearer_token(value: &str) -> Option<&str> {
    const PREFIX: &str = "bearer ";
    if value.len() <= PREFIX.len() || !value[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return None;
    }
    Some(&value[PREFIX.len()..])
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let info = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .and_then(|token| state.auth.resolve(token))
        .unwrap_or_default();
    request.extensions_mut().insert(info);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> ConfigFile {
        ConfigFile::parse(
            r#"
users:
  acme:
    api_keys:
      alice: key-alice
  globex:
    api_keys:
      carol: key-carol
"#,
        )
        .unwrap()
    }

    #[test]
    fn keys_resolve_to_user_and_org() {
        let auth = ApiKeyAuth::new();
        auth.update_from_config(&conf()).unwrap();

        let info = auth.resolve("key-alice").unwrap();
        assert_eq!(info.user, "alice");
        assert_eq!(info.org, "acme");
        assert!(auth.resolve("nope").is_none());
    }

    #[test]
    fn duplicate_keys_are_fatal() {
        let conf = ConfigFile::parse(
            r#"
users:
  acme:
    api_keys:
      alice: same-key
  globex:
    api_keys:
      carol: same-key
"#,
        )
        .unwrap();
        let auth = ApiKeyAuth::new();
        assert!(matches!(
            auth.update_from_config(&conf),
            Err(ProxyError::Config(_))
        ));
    }

    #[test]
    fn bearer_prefix_is_case_insensitive() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer abc"), Some("abc"));
        assert_eq!(bearer_token("BEARER abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
