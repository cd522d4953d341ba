//! Resource and prompt providers
//!
//! Catalog providers are external collaborators. The dispatcher only needs
//! to resolve a URI to the provider claiming it, either by explicit provider
//! id or by asking each provider whether it can handle the URI.

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait ContentProvider: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn can_handle(&self, uri: &str) -> bool;

    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Descriptor>>;

    async fn read(&self, uri: &str, ctx: &ExecutionContext) -> Result<Value>;
}

pub struct ProviderRegistry {
    kind: &'static str,
    providers: ArcSwap<Vec<Arc<dyn ContentProvider>>>,
}

impl ProviderRegistry {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            providers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Adds a provider, replacing any previously registered with the same id.
    pub fn register(&self, provider: Arc<dyn ContentProvider>) {
        tracing::debug!(kind = self.kind, provider = provider.id(), "Registering provider");
        self.providers.rcu(|current| {
            let mut next: Vec<Arc<dyn ContentProvider>> = current
                .iter()
                .filter(|p| p.id() != provider.id())
                .cloned()
                .collect();
            next.push(provider.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.providers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resolve(
        &self,
        uri: &str,
        provider_id: Option<&str>,
    ) -> Result<Arc<dyn ContentProvider>> {
        let providers = self.providers.load();
        let found = match provider_id {
            Some(id) => providers.iter().find(|p| p.id() == id),
            None => providers.iter().find(|p| p.can_handle(uri)),
        };
        found.cloned().ok_or_else(|| {
            RuntimeError::NotFound(match provider_id {
                Some(id) => format!("no {} provider with id '{id}'", self.kind),
                None => format!("no {} provider handles '{uri}'", self.kind),
            })
        })
    }

    /// Concatenated listing of every provider.
    pub async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<Descriptor>> {
        let providers = self.providers.load_full();
        let mut all = Vec::new();
        for provider in providers.iter() {
            all.extend(provider.list(ctx).await?);
        }
        Ok(all)
    }

    pub async fn read(
        &self,
        uri: &str,
        provider_id: Option<&str>,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        self.resolve(uri, provider_id)?.read(uri, ctx).await
    }
}
