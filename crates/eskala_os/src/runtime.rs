#![forbid(unsafe_code)]

use std::sync::Arc;

use eskala_kernel_contracts::versioned::SubjectTable;
use eskala_storage::shared::SharedConfigStore;

use crate::attribution::UserDirectory;
use crate::clock::Clock;
use crate::config::EskalaConfig;
use crate::formulas::{FormulaRegistry, FORMULAS_TABLE};
use crate::fx_rates::{FxRateBook, FX_RATES_TABLE};
use crate::vkvs::{VersionedConfigEngine, VersionedConfigError};

/// Both datasets over one shared store, with explicit clock and user directory.
#[derive(Clone)]
pub struct EskalaRuntime {
    config: EskalaConfig,
    store: SharedConfigStore,
    formulas: FormulaRegistry,
    fx_rates: FxRateBook,
}

impl EskalaRuntime {
    pub fn from_config(
        config: EskalaConfig,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, VersionedConfigError> {
        let store = match &config.store_path {
            Some(path) => SharedConfigStore::open_journaled(path)?,
            None => SharedConfigStore::in_memory(),
        };
        let journaled = store.is_journaled()?;
        tracing::info!(
            journaled,
            history_limit = config.history_limit,
            "eskala runtime ready"
        );
        Self::with_store(config, store, clock, directory)
    }

    pub fn with_store(
        config: EskalaConfig,
        store: SharedConfigStore,
        clock: Arc<dyn Clock>,
        directory: Arc<dyn UserDirectory>,
    ) -> Result<Self, VersionedConfigError> {
        let formulas = FormulaRegistry::new(
            VersionedConfigEngine::new(
                SubjectTable::new(FORMULAS_TABLE)?,
                store.clone(),
                Arc::clone(&clock),
            ),
            Arc::clone(&directory),
            config.history_limit,
        );
        let fx_rates = FxRateBook::new(
            VersionedConfigEngine::new(SubjectTable::new(FX_RATES_TABLE)?, store.clone(), clock),
            directory,
            config.default_fx_rate,
        );
        Ok(Self {
            config,
            store,
            formulas,
            fx_rates,
        })
    }

    pub fn config(&self) -> &EskalaConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedConfigStore {
        &self.store
    }

    pub fn formulas(&self) -> &FormulaRegistry {
        &self.formulas
    }

    pub fn fx_rates(&self) -> &FxRateBook {
        &self.fx_rates
    }
}
