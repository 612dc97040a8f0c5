//! Caller identification.
//!
//! Owners are opaque ids carried in the `user` cookie or the `Authorization`
//! header. A request without either gets a freshly issued id, returned to the
//! client in both places. Nothing here verifies the id; it only scopes which
//! redirects a caller may list and delete.

use axum::{
    extract::Request,
    http::{
        header::{AUTHORIZATION, COOKIE, SET_COOKIE},
        HeaderMap, HeaderValue,
    },
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

pub const USER_COOKIE: &str = "user";

/// Identity attached to every request by [`owner_middleware`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub id: String,
    /// `true` when the id was minted for this request, i.e. the caller
    /// presented no identity of their own.
    pub issued: bool,
}

impl Owner {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        cookie_value(headers, USER_COOKIE)
            .or_else(|| authorization_value(headers))
            .map(|id| Owner { id, issued: false })
    }

    fn issue() -> Self {
        Owner {
            id: Uuid::now_v7().to_string(),
            issued: true,
        }
    }
}

pub async fn owner_middleware(mut request: Request, next: Next) -> Response {
    let owner = Owner::from_headers(request.headers()).unwrap_or_else(Owner::issue);
    request.extensions_mut().insert(owner.clone());

    let mut response = next.run(request).await;

    if owner.issued {
        debug!(owner = %owner.id, "issued new owner id");
        let headers = response.headers_mut();
        if let Ok(cookie) =
            HeaderValue::from_str(&format!("{USER_COOKIE}={}; Path=/; HttpOnly", owner.id))
        {
            headers.append(SET_COOKIE, cookie);
        }
        if let Ok(value) = HeaderValue::from_str(&owner.id) {
            headers.insert(AUTHORIZATION, value);
        }
    }

    response
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn authorization_value(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let id = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    (!id.is_empty()).then(|| id.to_string())
}
