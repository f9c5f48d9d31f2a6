//! Plugin constructors keyed by plugin type.
//!
//! The engine never names a concrete adapter. Each supported format registers
//! a constructor here; plugins that must run out of process go through the
//! bridge constructor instead.
//!
//! # Example
//! ```ignore
//! let factory = PluginFactory::new();
//! factory.register_lv2(Arc::new(NativeLv2World::new(catalog)));
//! let engine = Engine::new(EngineOptions::default(), factory);
//! ```

use cadenza_core::{BinaryType, EngineOptions, Error, PluginType, Result};
use cadenza_plugin::lv2::Lv2World;
use cadenza_plugin::{EngineInit, Lv2Plugin, Plugin, PluginInit};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Builds one plugin instance. Receives the slot id the plugin will occupy.
pub type PluginConstructor = Arc<
    dyn Fn(u32, PluginInit, &EngineInit) -> cadenza_plugin::Result<Arc<dyn Plugin>> + Send + Sync,
>;

/// Builds a bridged plugin; also receives the bridge executable.
pub type BridgeConstructor = Arc<
    dyn Fn(u32, PluginInit, &EngineInit, &Path) -> cadenza_plugin::Result<Arc<dyn Plugin>>
        + Send
        + Sync,
>;

/// How a plugin gets instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instantiation {
    InProcess,
    Bridge(PathBuf),
}

/// Executable name of the plugin bridge for `binary_type`.
pub fn bridge_binary_name(binary_type: BinaryType) -> Option<String> {
    let suffix = if binary_type == BinaryType::native() {
        "native"
    } else {
        match binary_type {
            BinaryType::Posix32 => "posix32",
            BinaryType::Posix64 => "posix64",
            BinaryType::Win32 => "win32.exe",
            BinaryType::Win64 => "win64.exe",
            BinaryType::None | BinaryType::Other => return None,
        }
    };
    Some(format!("cadenza-bridge-{suffix}"))
}

/// Installed bridge executable for `binary_type`, if any.
pub fn find_bridge_binary(options: &EngineOptions, binary_type: BinaryType) -> Option<PathBuf> {
    let dir = options.binary_dir.as_ref()?;
    let path = dir.join(bridge_binary_name(binary_type)?);
    path.is_file().then_some(path)
}

/// Decide between in-process and bridged instantiation.
///
/// Plugins of a foreign architecture must be bridged; native ones are bridged
/// only when bridges are preferred and installed. Internal, soundfont and
/// JACK plugins always run in process.
pub fn choose_instantiation(init: &PluginInit, options: &EngineOptions) -> Result<Instantiation> {
    let can_be_bridged = !init.plugin_type.never_bridged();
    if !can_be_bridged {
        return Ok(Instantiation::InProcess);
    }

    let bridge = find_bridge_binary(options, init.binary_type);
    let foreign = init.binary_type != BinaryType::native();

    if foreign || (options.prefer_plugin_bridges && bridge.is_some()) {
        return match bridge {
            Some(path) => Ok(Instantiation::Bridge(path)),
            None => Err(Error::Plugin(
                "This build cannot handle this binary".to_string(),
            )),
        };
    }
    Ok(Instantiation::InProcess)
}

/// Registry of plugin constructors.
#[derive(Default)]
pub struct PluginFactory {
    constructors: RwLock<HashMap<PluginType, PluginConstructor>>,
    bridge: RwLock<Option<BridgeConstructor>>,
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("types", &self.types())
            .field("bridge", &self.bridge.read().is_some())
            .finish()
    }
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory hosting LV2 plugins from `world`.
    pub fn with_lv2(world: Arc<dyn Lv2World>) -> Self {
        let factory = Self::new();
        factory.register_lv2(world);
        factory
    }

    /// Register the constructor for `plugin_type`, replacing any previous one.
    pub fn register<F>(&self, plugin_type: PluginType, constructor: F)
    where
        F: Fn(u32, PluginInit, &EngineInit) -> cadenza_plugin::Result<Arc<dyn Plugin>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .write()
            .insert(plugin_type, Arc::new(constructor));
    }

    pub fn register_lv2(&self, world: Arc<dyn Lv2World>) {
        self.register(PluginType::Lv2, move |id, init, engine| {
            let plugin = Lv2Plugin::new(Arc::clone(&world), id, init, engine)?;
            Ok(Arc::new(plugin) as Arc<dyn Plugin>)
        });
    }

    pub fn register_bridge<F>(&self, constructor: F)
    where
        F: Fn(u32, PluginInit, &EngineInit, &Path) -> cadenza_plugin::Result<Arc<dyn Plugin>>
            + Send
            + Sync
            + 'static,
    {
        *self.bridge.write() = Some(Arc::new(constructor));
    }

    pub fn supports(&self, plugin_type: PluginType) -> bool {
        self.constructors.read().contains_key(&plugin_type)
    }

    pub fn types(&self) -> Vec<PluginType> {
        let mut types: Vec<PluginType> = self.constructors.read().keys().copied().collect();
        types.sort_by_key(|ty| ty.index());
        types
    }

    /// Instantiate a plugin the way `how` says.
    pub fn create(
        &self,
        how: &Instantiation,
        id: u32,
        init: PluginInit,
        engine: &EngineInit,
    ) -> Result<Arc<dyn Plugin>> {
        let plugin = match how {
            Instantiation::InProcess => {
                let constructor = self
                    .constructors
                    .read()
                    .get(&init.plugin_type)
                    .cloned()
                    .ok_or_else(|| {
                        Error::Plugin("Invalid or unsupported plugin type".to_string())
                    })?;
                constructor(id, init, engine)
            }
            Instantiation::Bridge(binary) => {
                let constructor = self.bridge.read().clone().ok_or_else(|| {
                    Error::Plugin("This build cannot handle this binary".to_string())
                })?;
                constructor(id, init, engine, binary)
            }
        };
        plugin.map_err(|e| Error::Plugin(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::StubPlugin;
    use tempfile::TempDir;

    fn init(plugin_type: PluginType, binary_type: BinaryType) -> PluginInit {
        PluginInit {
            binary_type,
            plugin_type,
            label: "stub".to_string(),
            ..Default::default()
        }
    }

    fn foreign_binary() -> BinaryType {
        if BinaryType::native() == BinaryType::Win32 {
            BinaryType::Win64
        } else {
            BinaryType::Win32
        }
    }

    #[test]
    fn test_native_plugin_runs_in_process() {
        let options = EngineOptions::default();
        let how = choose_instantiation(&init(PluginType::Lv2, BinaryType::native()), &options);
        assert_eq!(how.unwrap(), Instantiation::InProcess);
    }

    #[test]
    fn test_foreign_binary_needs_bridge() {
        let options = EngineOptions::default();
        let err = choose_instantiation(&init(PluginType::Vst2, foreign_binary()), &options)
            .unwrap_err();
        assert_eq!(err.to_string(), "This build cannot handle this binary");
    }

    #[test]
    fn test_soundfonts_never_bridge() {
        let options = EngineOptions::default();
        let how = choose_instantiation(&init(PluginType::Sf2, foreign_binary()), &options);
        assert_eq!(how.unwrap(), Instantiation::InProcess);
    }

    #[test]
    fn test_prefer_bridges_uses_installed_bridge() {
        let dir = TempDir::new().unwrap();
        let name = bridge_binary_name(BinaryType::native()).unwrap();
        std::fs::write(dir.path().join(&name), b"").unwrap();

        let mut options = EngineOptions::default();
        options.binary_dir = Some(dir.path().to_path_buf());
        let native = init(PluginType::Lv2, BinaryType::native());

        assert_eq!(
            choose_instantiation(&native, &options).unwrap(),
            Instantiation::InProcess
        );
        options.prefer_plugin_bridges = true;
        assert_eq!(
            choose_instantiation(&native, &options).unwrap(),
            Instantiation::Bridge(dir.path().join(name))
        );
    }

    #[test]
    fn test_create_uses_registered_constructor() {
        let factory = PluginFactory::new();
        factory.register(PluginType::Internal, |id, init, engine| {
            Ok(StubPlugin::with_init(id, init, engine))
        });
        assert!(factory.supports(PluginType::Internal));
        assert_eq!(factory.types(), vec![PluginType::Internal]);

        let engine = EngineInit::default();
        let mut plugin_init = init(PluginType::Internal, BinaryType::native());
        plugin_init.name = "made".to_string();
        let plugin = factory
            .create(&Instantiation::InProcess, 4, plugin_init, &engine)
            .unwrap();
        assert_eq!(plugin.id(), 4);
        assert_eq!(plugin.name(), "made");
    }

    #[test]
    fn test_create_unsupported_type() {
        let factory = PluginFactory::new();
        let engine = EngineInit::default();
        let result = factory.create(
            &Instantiation::InProcess,
            0,
            init(PluginType::Vst3, BinaryType::native()),
            &engine,
        );
        let Err(err) = result else {
            panic!("a type without a constructor was created");
        };
        assert_eq!(err.to_string(), "Invalid or unsupported plugin type");
    }

    #[test]
    fn test_bridge_constructor_gets_binary() {
        let factory = PluginFactory::new();
        factory.register_bridge(|id, init, engine, binary| {
            assert!(binary.ends_with("cadenza-bridge-win32.exe"));
            Ok(StubPlugin::with_init(id, init, engine))
        });
        let engine = EngineInit::default();
        let how = Instantiation::Bridge(PathBuf::from("/opt/bin/cadenza-bridge-win32.exe"));
        assert!(factory
            .create(&how, 0, init(PluginType::Vst2, BinaryType::Win32), &engine)
            .is_ok());
    }
}
