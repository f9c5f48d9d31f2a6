//! Builder for a ready-to-use host: engine, plugin formats and a started driver.

use crate::engine::{DummyDriver, Engine, PluginFactory};
use crate::Result;
use cadenza_core::{EngineCallback, EngineOptions, FileCallback};
use cadenza_plugin::lv2::Lv2World;
use std::sync::Arc;

#[cfg(feature = "native-lv2")]
use std::path::PathBuf;

/// LV2 support is registered when a world is supplied, either directly or
/// (with the `native-lv2` feature) from a scan cache file.
///
/// # Example
///
/// ```ignore
/// use cadenza::prelude::*;
///
/// let engine = HostBuilder::default()
///     .options(EngineOptions { process_mode: ProcessMode::Patchbay, ..Default::default() })
///     .callback(Arc::new(|event: &CallbackEvent| println!("{:?}", event.opcode)))
///     .start()?;
///
/// engine.load_project(Path::new("session.carxp"))?;
/// ```
#[derive(Default)]
pub struct HostBuilder {
    options: EngineOptions,
    callback: Option<EngineCallback>,
    file_callback: Option<FileCallback>,
    lv2_world: Option<Arc<dyn Lv2World>>,
    #[cfg(feature = "native-lv2")]
    lv2_cache: Option<PathBuf>,
    driver: Option<String>,
}

impl HostBuilder {
    pub fn options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn callback(mut self, callback: EngineCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn file_callback(mut self, callback: FileCallback) -> Self {
        self.file_callback = Some(callback);
        self
    }

    pub fn lv2_world(mut self, world: Arc<dyn Lv2World>) -> Self {
        self.lv2_world = Some(world);
        self
    }

    /// Binds real LV2 binaries described by a scan cache.
    #[cfg(feature = "native-lv2")]
    pub fn lv2_cache(mut self, path: impl Into<PathBuf>) -> Self {
        self.lv2_cache = Some(path.into());
        self
    }

    /// Default: the dummy driver
    pub fn driver(mut self, name: impl Into<String>) -> Self {
        self.driver = Some(name.into());
        self
    }

    /// Builds the engine without starting a driver.
    pub fn build(self) -> Result<Arc<Engine>> {
        let factory = PluginFactory::new();

        #[cfg(feature = "native-lv2")]
        if let Some(path) = &self.lv2_cache {
            let world = cadenza_plugin::lv2::NativeLv2World::from_cache(path)?;
            tracing::info!("Loaded LV2 catalog from {}", path.display());
            factory.register_lv2(Arc::new(world));
        }

        if let Some(world) = self.lv2_world {
            factory.register_lv2(world);
        }

        let mut builder = Engine::builder().options(self.options).factory(factory);
        if let Some(callback) = self.callback {
            builder = builder.callback(callback);
        }
        if let Some(callback) = self.file_callback {
            builder = builder.file_callback(callback);
        }
        Ok(builder.build())
    }

    /// Builds the engine and starts its driver.
    pub fn start(self) -> Result<Arc<Engine>> {
        let driver = self
            .driver
            .clone()
            .unwrap_or_else(|| DummyDriver::NAME.to_string());
        let engine = self.build()?;
        engine.init(&driver)?;
        Ok(engine)
    }
}
