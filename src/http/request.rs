use serde::{Deserialize, Serialize};

use crate::auth::AuthMethod;

use super::method::HttpMethod;

/// A request after variable resolution, ready for the transport. `url`
/// already carries the assembled query string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub name: String,
    pub method: HttpMethod,
    pub url: String,
    pub headers: String,
    pub body: String,
    pub auth: AuthMethod,
    pub timeout_ms: u64,
}
