//! The method-invocation seam consumed by higher layers.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use truenas_core::{FieldValue, Result};

/// Anything that can invoke a remote method and await its result.
///
/// [`Connection`](crate::Connection) is the production implementation;
/// caches and job lookups depend only on this trait.
#[async_trait]
pub trait MethodInvoker: Send + Sync {
    /// Invoke `method` with ordered `params`.
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue>;
}

#[async_trait]
impl<T: MethodInvoker + ?Sized> MethodInvoker for Arc<T> {
    async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<FieldValue> {
        (**self).invoke(method, params).await
    }
}
