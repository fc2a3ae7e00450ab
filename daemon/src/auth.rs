/// Static bearer-token authentication for debug clients
use crate::config::ServerConfig;
use crate::errors::{DaemonError, DaemonResult};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use url::form_urlencoded;

/// Authentication manager
pub struct AuthManager {
    require_auth: bool,
    tokens: Vec<String>,
}

impl AuthManager {
    /// Create a new authentication manager
    pub fn new(config: &ServerConfig) -> Self {
        AuthManager {
            require_auth: config.require_auth,
            tokens: config.auth_tokens.clone(),
        }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.require_auth
    }

    /// Authenticate a presented token. With authentication disabled every
    /// connection is accepted, whatever it presents.
    pub fn authenticate(&self, token: Option<&str>) -> DaemonResult<AuthContext> {
        let matched = token.and_then(|t| self.tokens.iter().position(|known| known == t));

        match (matched, self.require_auth) {
            (Some(index), _) => Ok(AuthContext::new(format!("token-{}", index + 1))),
            (None, false) => Ok(AuthContext::anonymous()),
            (None, true) if token.is_none() => Err(DaemonError::AuthenticationError(
                "missing bearer token".to_string(),
            )),
            (None, true) => Err(DaemonError::AuthenticationError(
                "invalid bearer token".to_string(),
            )),
        }
    }

    /// Authenticate a WebSocket upgrade request
    pub fn authenticate_request(&self, request: &Request) -> DaemonResult<AuthContext> {
        self.authenticate(extract_token(request).as_deref())
    }
}

/// Identity attached to a debug session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub identity: String,
    pub authenticated: bool,
}

impl AuthContext {
    /// Create a new authenticated context
    pub fn new(identity: String) -> Self {
        AuthContext {
            identity,
            authenticated: true,
        }
    }

    /// Create an unauthenticated context
    pub fn anonymous() -> Self {
        AuthContext {
            identity: "anonymous".to_string(),
            authenticated: false,
        }
    }
}

/// Token from the `Authorization` header, falling back to a `token` query
/// parameter
pub fn extract_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .or_else(|| request.uri().query().and_then(token_from_query))
}

pub fn parse_bearer_token(header: &str) -> Option<String> {
    let trimmed = header.trim();
    let mut parts = trimmed.splitn(2, ' ');
    let scheme = parts.next()?.to_ascii_lowercase();
    if scheme != "bearer" {
        return None;
    }
    let token = parts.next()?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// `token` parameter of a URL query string, percent-decoded
pub fn token_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, value)| key == "token" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(require_auth: bool) -> AuthManager {
        AuthManager::new(&ServerConfig {
            require_auth,
            auth_tokens: vec!["alpha".to_string(), "beta".to_string()],
            ..Default::default()
        })
    }

    #[test]
    fn test_parse_bearer_token() {
        assert_eq!(parse_bearer_token("Bearer abc"), Some("abc".to_string()));
        assert_eq!(parse_bearer_token("bearer  abc "), Some("abc".to_string()));
        assert_eq!(parse_bearer_token("Basic abc"), None);
        assert_eq!(parse_bearer_token("Bearer"), None);
    }

    #[test]
    fn test_token_from_query() {
        assert_eq!(token_from_query("token=abc"), Some("abc".to_string()));
        assert_eq!(token_from_query("a=1&token=xyz"), Some("xyz".to_string()));
        assert_eq!(token_from_query("token="), None);
        assert_eq!(token_from_query("tokens=abc"), None);
    }

    #[test]
    fn test_token_from_query_is_percent_decoded() {
        assert_eq!(token_from_query("token=a%2Fb%3D%3D"), Some("a/b==".to_string()));
        assert_eq!(token_from_query("token=two+words"), Some("two words".to_string()));
        assert_eq!(token_from_query("x=1&t%6Fken=abc"), Some("abc".to_string()));

        let auth = AuthManager::new(&ServerConfig {
            require_auth: true,
            auth_tokens: vec!["s3cr/t+key".to_string()],
            ..Default::default()
        });
        let token = token_from_query("token=s3cr%2Ft%2Bkey");
        assert_eq!(auth.authenticate(token.as_deref()).unwrap().identity, "token-1");
    }

    #[test]
    fn test_required_auth() {
        let auth = manager(true);
        assert_eq!(
            auth.authenticate(Some("beta")).unwrap().identity,
            "token-2"
        );
        assert!(matches!(
            auth.authenticate(Some("gamma")),
            Err(DaemonError::AuthenticationError(_))
        ));
        assert!(matches!(
            auth.authenticate(None),
            Err(DaemonError::AuthenticationError(_))
        ));
    }

    #[test]
    fn test_optional_auth_accepts_anything() {
        let auth = manager(false);
        assert!(!auth.authenticate(None).unwrap().authenticated);
        assert!(!auth.authenticate(Some("garbage")).unwrap().authenticated);
        assert!(auth.authenticate(Some("alpha")).unwrap().authenticated);
    }

    #[test]
    fn test_extract_token_from_request() {
        let request = Request::builder()
            .uri("ws://localhost/debug?token=alpha")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request), Some("alpha".to_string()));

        let request = Request::builder()
            .uri("ws://localhost/debug?token=alpha")
            .header("Authorization", "Bearer beta")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request), Some("beta".to_string()));
    }
}
