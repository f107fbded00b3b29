use http::HeaderName;

use crate::service::TenantId;

pub const X_TENANT_ID_HEADER_NAME: HeaderName = HeaderName::from_static("x-tenant-id");
pub const X_REQUEST_ID_HEADER_NAME: HeaderName = HeaderName::from_static("x-request-id");

/// Per-request context: the request id echoed back to the caller and the
/// tenant scope every downstream call is bound to.
///
/// The tenant is taken from the `X-Tenant-Id` header; an absent header means
/// the global scope (empty tenant). The scope is never widened downstream.
#[derive(Debug, Clone)]
pub struct RequestMetadata {
    request_id: String,
    tenant_id: TenantId,
}

impl RequestMetadata {
    #[must_use]
    pub fn new(request_id: String, tenant_id: TenantId) -> Self {
        Self {
            request_id,
            tenant_id,
        }
    }

    /// Extract metadata from request headers, minting a request id when the
    /// inbound request carries none. Provider delivery ids count as request
    /// id variants.
    #[must_use]
    pub fn from_headers(headers: &http::HeaderMap) -> Self {
        let request_id = ["x-request-id", "x-github-delivery", "request-id"]
            .iter()
            .find_map(|name| headers.get(*name))
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map_or_else(|| uuid::Uuid::now_v7().to_string(), ToString::to_string);
        let tenant_id = headers
            .get(X_TENANT_ID_HEADER_NAME)
            .and_then(|v| v.to_str().ok())
            .map(TenantId::from)
            .unwrap_or_default();
        Self {
            request_id,
            tenant_id,
        }
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }
}

/// Middleware inserting [`RequestMetadata`] into request extensions so
/// handlers can extract it.
pub(crate) async fn create_request_metadata_fn(
    mut request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let metadata = RequestMetadata::from_headers(request.headers());
    request.extensions_mut().insert(metadata);
    next.run(request).await
}

impl<S> axum::extract::FromRequestParts<S> for RequestMetadata
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut http::request::Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestMetadata>()
            .cloned()
            .unwrap_or_else(|| RequestMetadata::from_headers(&parts.headers)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_headers_mint_request_id_and_global_tenant() {
        let headers = http::HeaderMap::new();
        let meta = RequestMetadata::from_headers(&headers);
        assert!(!meta.request_id().is_empty());
        assert!(meta.tenant_id().is_global());
    }

    #[test]
    fn delivery_header_counts_as_request_id() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-github-delivery", "delivery-9".parse().unwrap());
        let meta = RequestMetadata::from_headers(&headers);
        assert_eq!(meta.request_id(), "delivery-9");
    }

    #[test]
    fn headers_are_honored() {
        let mut headers = http::HeaderMap::new();
        headers.insert(X_REQUEST_ID_HEADER_NAME, "req-1".parse().unwrap());
        headers.insert(X_TENANT_ID_HEADER_NAME, "acme".parse().unwrap());
        let meta = RequestMetadata::from_headers(&headers);
        assert_eq!(meta.request_id(), "req-1");
        assert_eq!(meta.tenant_id().as_str(), "acme");
    }
}
