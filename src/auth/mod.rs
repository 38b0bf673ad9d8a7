//! # Authentication
//!
//! Authentication methods attached to a request: Bearer Token, Basic Auth,
//! and API Key (header or query). Auth fields may contain `{{variable}}`
//! tokens and are resolved together with the rest of the request.

use serde::{Deserialize, Serialize};

use crate::environment::ScopeChain;

/// Supported authentication methods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    BearerToken {
        token: String,
    },
    BasicAuth {
        username: String,
        password: String,
    },
    ApiKey {
        key: String,
        value: String,
        location: ApiKeyLocation,
    },
}

/// Where to place the API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyLocation {
    Header,
    Query,
}

impl Default for AuthMethod {
    fn default() -> Self {
        AuthMethod::None
    }
}

impl AuthMethod {
    /// Resolve `{{variable}}` tokens in every credential field.
    pub fn resolve(&self, scopes: &ScopeChain) -> AuthMethod {
        match self {
            AuthMethod::None => AuthMethod::None,
            AuthMethod::BearerToken { token } => AuthMethod::BearerToken {
                token: scopes.resolve(token),
            },
            AuthMethod::BasicAuth { username, password } => AuthMethod::BasicAuth {
                username: scopes.resolve(username),
                password: scopes.resolve(password),
            },
            AuthMethod::ApiKey {
                key,
                value,
                location,
            } => AuthMethod::ApiKey {
                key: scopes.resolve(key),
                value: scopes.resolve(value),
                location: *location,
            },
        }
    }
}
