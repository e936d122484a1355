//! Worklet bridge: instantiate a named playback unit, loading its module on demand
//!
//! Acquisition is a two-step protocol against the context's unit registry:
//! 1. Try to instantiate the unit. If it is registered, done.
//! 2. Otherwise load `{asset_root}/{unit}.js` through the `UnitLoader`,
//!    install what the module registers, and instantiate again. A second
//!    miss is a `UnitLoad` error, never a third attempt.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use super::context::PlaybackContext;
use super::worklet::{port_channel, AudioUnit, OutputWorklet, PlayoutStatus, WorkletMessage, WorkletPort};
use crate::error::PipelineError;
use crate::stats::PipelineStats;

/// Name of the built-in jitter-buffer playback unit.
pub const OUTPUT_UNIT_NAME: &str = "audio-output-processor";

/// Construction parameters handed to a unit factory.
#[derive(Debug, Clone)]
pub struct UnitOptions {
    pub sample_rate: u32,
    pub initial_buffer_ms: u32,
    pub max_buffer_ms: u32,
    pub stats: Arc<PipelineStats>,
}

/// An instantiated unit: the render-side processor plus its message port.
pub struct WorkletNode {
    name: String,
    port: WorkletPort,
    unit: Box<dyn AudioUnit>,
    status: Arc<PlayoutStatus>,
}

impl WorkletNode {
    pub fn new(
        name: impl Into<String>,
        port: WorkletPort,
        unit: Box<dyn AudioUnit>,
        status: Arc<PlayoutStatus>,
    ) -> Self {
        Self {
            name: name.into(),
            port,
            unit,
            status,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> &WorkletPort {
        &self.port
    }

    pub(crate) fn into_parts(self) -> (WorkletPort, Box<dyn AudioUnit>, Arc<PlayoutStatus>) {
        (self.port, self.unit, self.status)
    }
}

impl fmt::Debug for WorkletNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkletNode").field("name", &self.name).finish()
    }
}

pub type UnitFactory =
    Arc<dyn Fn(&UnitOptions) -> Result<WorkletNode, PipelineError> + Send + Sync>;

/// What a loaded module contributes: named unit factories.
#[derive(Default, Clone)]
pub struct UnitModule {
    units: Vec<(String, UnitFactory)>,
}

impl UnitModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unit(mut self, name: impl Into<String>, factory: UnitFactory) -> Self {
        self.units.push((name.into(), factory));
        self
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.units.iter().map(|(name, _)| name.as_str())
    }
}

/// Result of a single instantiation attempt.
pub enum Instantiation {
    Ready(WorkletNode),
    NotRegistered,
}

/// Per-context table of registered units.
#[derive(Default)]
pub struct UnitRegistry {
    factories: HashMap<String, UnitFactory>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Register everything a module provides. Re-registering a name replaces it.
    pub fn install(&mut self, module: UnitModule) {
        for (name, factory) in module.units {
            log::debug!("UnitRegistry: registered '{}'", name);
            self.factories.insert(name, factory);
        }
    }

    pub fn instantiate(
        &self,
        name: &str,
        options: &UnitOptions,
    ) -> Result<Instantiation, PipelineError> {
        match self.factories.get(name) {
            Some(factory) => factory(options).map(Instantiation::Ready),
            None => Ok(Instantiation::NotRegistered),
        }
    }
}

/// Resolves module paths to unit modules.
pub trait UnitLoader: Send + Sync {
    fn load_module<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<UnitModule, PipelineError>>;
}

/// Serves the units compiled into this crate.
#[derive(Debug, Default, Clone)]
pub struct BuiltinUnitLoader;

impl UnitLoader for BuiltinUnitLoader {
    fn load_module<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<UnitModule, PipelineError>> {
        Box::pin(async move {
            let file = path.rsplit('/').next().unwrap_or(path);
            if file == format!("{}.js", OUTPUT_UNIT_NAME) {
                Ok(UnitModule::new().with_unit(OUTPUT_UNIT_NAME, output_unit_factory()))
            } else {
                Err(PipelineError::UnitLoad {
                    unit: file.trim_end_matches(".js").to_string(),
                    reason: format!("no module at {}", path),
                })
            }
        })
    }
}

/// Factory for the jitter-buffer playback unit.
pub fn output_unit_factory() -> UnitFactory {
    Arc::new(|options: &UnitOptions| {
        let (port, rx): (WorkletPort, mpsc::Receiver<WorkletMessage>) = port_channel();
        let unit = OutputWorklet::new(
            rx,
            options.sample_rate,
            options.initial_buffer_ms,
            options.max_buffer_ms,
            Arc::clone(&options.stats),
        );
        let status = unit.status();
        Ok(WorkletNode::new(OUTPUT_UNIT_NAME, port, Box::new(unit), status))
    })
}

/// `{asset_root}/{unit}.js`
pub fn module_path(asset_root: &str, unit: &str) -> String {
    format!("{}/{}.js", asset_root.trim_end_matches('/'), unit)
}

/// Instantiate `unit` on `context`, loading its module if it is not registered yet.
pub async fn acquire_worklet_node(
    context: &mut PlaybackContext,
    loader: &dyn UnitLoader,
    unit: &str,
    options: &UnitOptions,
    asset_root: &str,
    load_timeout: Duration,
) -> Result<WorkletNode, PipelineError> {
    if let Instantiation::Ready(node) = context.registry().instantiate(unit, options)? {
        return Ok(node);
    }

    let path = module_path(asset_root, unit);
    log::info!("WorkletBridge: '{}' not registered, loading {}", unit, path);

    let module = tokio::time::timeout(load_timeout, loader.load_module(&path))
        .await
        .map_err(|_| PipelineError::UnitLoad {
            unit: unit.to_string(),
            reason: format!("loading {} timed out after {:?}", path, load_timeout),
        })??;

    log::debug!(
        "WorkletBridge: {} provides [{}]",
        path,
        module.unit_names().collect::<Vec<_>>().join(", ")
    );
    context.registry_mut().install(module);

    match context.registry().instantiate(unit, options)? {
        Instantiation::Ready(node) => Ok(node),
        Instantiation::NotRegistered => Err(PipelineError::UnitLoad {
            unit: unit.to_string(),
            reason: format!("{} did not register the unit", path),
        }),
    }
}
