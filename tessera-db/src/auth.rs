//! Write authorization.
//!
//! Every put, delete and link is offered to a [`WriteAuthorizer`] before any
//! cache entry is touched or any I/O is issued. A denial surfaces as
//! [`TesseraError::Forbidden`].

use async_trait::async_trait;
use serde_json::Value;
use tessera_core::{TesseraError, TesseraResult};

/// Kind of write being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteAction {
    Put,
    Delete,
    Link,
}

/// The target of a write, as seen by the authorizer.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationRequest {
    /// Tenant the write lands in.
    pub organisation_id: String,
    pub type_name: String,
    /// `None` for a put that will be assigned a fresh id.
    pub id: Option<String>,
    pub action: WriteAction,
    /// Serialized entity for puts.
    pub payload: Option<Value>,
}

impl AuthorizationRequest {
    pub(crate) fn denied(&self) -> TesseraError {
        TesseraError::Forbidden {
            organisation_id: self.organisation_id.clone(),
            type_name: self.type_name.clone(),
            id: self.id.clone(),
        }
    }
}

/// Asynchronous predicate over an attempted write.
#[async_trait]
pub trait WriteAuthorizer: Send + Sync {
    /// `Ok(false)` denies the write; an error aborts it as-is.
    async fn authorize(&self, request: &AuthorizationRequest) -> TesseraResult<bool>;
}

/// Permits every write.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl WriteAuthorizer for AllowAll {
    async fn authorize(&self, _request: &AuthorizationRequest) -> TesseraResult<bool> {
        Ok(true)
    }
}

/// Synchronous predicates are authorizers too.
#[async_trait]
impl<F> WriteAuthorizer for F
where
    F: Fn(&AuthorizationRequest) -> bool + Send + Sync,
{
    async fn authorize(&self, request: &AuthorizationRequest) -> TesseraResult<bool> {
        Ok(self(request))
    }
}

pub(crate) async fn ensure_allowed(
    authorizer: &dyn WriteAuthorizer,
    request: AuthorizationRequest,
) -> TesseraResult<()> {
    if authorizer.authorize(&request).await? {
        Ok(())
    } else {
        tracing::debug!(
            organisation_id = %request.organisation_id,
            entity_type = %request.type_name,
            action = ?request.action,
            "Write denied"
        );
        Err(request.denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(action: WriteAction) -> AuthorizationRequest {
        AuthorizationRequest {
            organisation_id: "acme".to_string(),
            type_name: "widget".to_string(),
            id: Some("w1".to_string()),
            action,
            payload: None,
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(ensure_allowed(&AllowAll, request(WriteAction::Put)).await.is_ok());
    }

    #[tokio::test]
    async fn test_closure_denial_is_forbidden() {
        let no_deletes = |r: &AuthorizationRequest| r.action != WriteAction::Delete;
        assert!(ensure_allowed(&no_deletes, request(WriteAction::Link)).await.is_ok());
        let err = ensure_allowed(&no_deletes, request(WriteAction::Delete))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::Forbidden { id: Some(_), .. }));
        assert!(!err.is_retryable());
    }
}
