//! Installs audio units into contexts at most once per `(context, unit)` pair.

use crate::context::{AudioContext, ContextId};
use crate::error::{AudioError, Result};
use crate::units::UnitCatalog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;

type RegistryKey = (ContextId, String);

/// Registry of units already installed per context.
///
/// Each pair owns a [`OnceCell`], so concurrent callers for the same pair
/// share a single install. A failed install leaves the cell empty and the
/// next call retries.
#[derive(Debug)]
pub struct UnitLoader {
    catalog: UnitCatalog,
    registry: Mutex<HashMap<RegistryKey, Arc<OnceCell<()>>>>,
}

impl UnitLoader {
    /// Create a loader over the given catalog.
    pub fn new(catalog: UnitCatalog) -> Self {
        Self { catalog, registry: Mutex::new(HashMap::new()) }
    }

    /// Process-wide loader with the built-in catalog.
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<UnitLoader>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::new(UnitCatalog::builtin()))).clone()
    }

    /// Ensure `unit_name` is installed in `context`, installing it if needed.
    pub async fn ensure_loaded(&self, context: &dyn AudioContext, unit_name: &str) -> Result<()> {
        let source = self
            .catalog
            .get(unit_name)
            .cloned()
            .ok_or_else(|| AudioError::load(unit_name, "unit not found in catalog"))?;

        let cell = {
            let mut registry = self.registry.lock();
            registry
                .entry((context.id(), unit_name.to_string()))
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        if cell.initialized() {
            return Ok(());
        }

        let source = &source;
        cell.get_or_try_init(|| async move {
            tracing::debug!(context = %context.id(), unit = unit_name, "Installing audio unit");
            context.install_unit(source).await.map_err(|e| match e {
                AudioError::LoadError { .. } => e,
                other => AudioError::load(unit_name, other.to_string()),
            })
        })
        .await?;

        Ok(())
    }

    /// Whether `unit_name` has been installed in the context.
    pub fn is_loaded(&self, context: ContextId, unit_name: &str) -> bool {
        self.registry
            .lock()
            .get(&(context, unit_name.to_string()))
            .is_some_and(|cell| cell.initialized())
    }

    /// Forget every entry for a context that has been closed.
    pub fn forget(&self, context: ContextId) {
        self.registry.lock().retain(|(id, _), _| *id != context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualAudioContext;
    use crate::units::METER_UNIT;

    #[tokio::test]
    async fn test_unknown_unit_is_load_error() {
        let loader = UnitLoader::new(UnitCatalog::builtin());
        let ctx = ManualAudioContext::new(24_000);
        let err = loader.ensure_loaded(&ctx, "reverb").await.unwrap_err();
        assert!(matches!(err, AudioError::LoadError { ref unit, .. } if unit == "reverb"));
        assert_eq!(ctx.install_count(), 0);
    }

    #[tokio::test]
    async fn test_forget_allows_reinstall() {
        let loader = UnitLoader::new(UnitCatalog::builtin());
        let ctx = ManualAudioContext::new(24_000);
        loader.ensure_loaded(&ctx, METER_UNIT).await.unwrap();
        assert!(loader.is_loaded(ctx.id(), METER_UNIT));

        loader.forget(ctx.id());
        assert!(!loader.is_loaded(ctx.id(), METER_UNIT));
        loader.ensure_loaded(&ctx, METER_UNIT).await.unwrap();
        assert_eq!(ctx.install_count(), 2);
    }
}
