//! Basic Auth validator for the admin policy-rule surface (§6).

use std::collections::HashMap;

use axum::extract::Request;
use base64::prelude::*;

use crate::config::AuthMode;

/// Result of authentication validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Allowed,
    Denied(String),
}

/// Validates admin requests against Basic Auth credentials.
#[derive(Clone)]
pub struct AuthValidator {
    mode: AuthMode,
    basic_credentials: HashMap<String, String>,
}

impl AuthValidator {
    pub fn new(mode: AuthMode, basic_credentials: HashMap<String, String>) -> Self {
        Self {
            mode,
            basic_credentials,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    pub fn validate(&self, request: &Request) -> AuthResult {
        match self.mode {
            AuthMode::Disabled => AuthResult::Allowed,
            AuthMode::BasicOnly => match self.extract_and_validate_basic_auth(request) {
                Some(username) => {
                    tracing::info!(user = %username, "basic auth validated");
                    AuthResult::Allowed
                }
                None => {
                    AuthResult::Denied("invalid or missing Basic Auth credentials".to_string())
                }
            },
        }
    }

    fn extract_and_validate_basic_auth(&self, request: &Request) -> Option<String> {
        let auth_header = request
            .headers()
            .get("Authorization")
            .and_then(|v| v.to_str().ok())?;

        let encoded = auth_header.strip_prefix("Basic ")?;
        let decoded = BASE64_STANDARD.decode(encoded).ok()?;
        let credentials = String::from_utf8(decoded).ok()?;

        let (username, password) = credentials.split_once(':')?;

        let expected_password = self.basic_credentials.get(username)?;
        if expected_password == password {
            Some(username.to_string())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;
    use maplit::hashmap;

    fn make_request(basic_auth: Option<(&str, &str)>) -> Request {
        let mut builder = HttpRequest::builder().uri("/admin/rules").method("GET");

        if let Some((username, password)) = basic_auth {
            let credentials = format!("{username}:{password}");
            let encoded = BASE64_STANDARD.encode(credentials.as_bytes());
            builder = builder.header("Authorization", format!("Basic {encoded}"));
        }

        builder.body(axum::body::Body::empty()).unwrap()
    }

    #[test]
    fn disabled_mode_allows_all() {
        let validator = AuthValidator::new(AuthMode::Disabled, hashmap! {});
        assert_eq!(
            validator.validate(&make_request(None)),
            AuthResult::Allowed
        );
    }

    #[test]
    fn basic_only_requires_valid_credentials() {
        let creds = hashmap! { "admin".to_string() => "hunter2".to_string() };
        let validator = AuthValidator::new(AuthMode::BasicOnly, creds);

        assert!(matches!(
            validator.validate(&make_request(None)),
            AuthResult::Denied(_)
        ));
        assert!(matches!(
            validator.validate(&make_request(Some(("admin", "wrong")))),
            AuthResult::Denied(_)
        ));
        assert_eq!(
            validator.validate(&make_request(Some(("admin", "hunter2")))),
            AuthResult::Allowed
        );
    }
}
