use cadenza_core::PluginType;
use cadenza_plugin::{
    EngineInit, Plugin, PluginCommon, PluginHints, PluginInit, PluginPorts, ProcessContext,
};
use std::sync::Arc;

/// Stereo plugin halving its input.
pub(crate) struct StubPlugin {
    common: PluginCommon,
}

impl StubPlugin {
    pub fn arc(id: u32, name: &str) -> Arc<dyn Plugin> {
        let init = PluginInit {
            plugin_type: PluginType::Internal,
            name: name.to_string(),
            label: "stub".to_string(),
            ..Default::default()
        };
        Self::with_init(id, init, &EngineInit::default())
    }

    pub fn with_init(id: u32, init: PluginInit, engine: &EngineInit) -> Arc<dyn Plugin> {
        Arc::new(Self {
            common: PluginCommon::new(id, init, engine),
        })
    }
}

impl Plugin for StubPlugin {
    fn common(&self) -> &PluginCommon {
        &self.common
    }

    fn plugin_type(&self) -> PluginType {
        self.common.init().plugin_type
    }

    fn reload(&self) -> cadenza_plugin::Result<()> {
        *self.common.ports.write() = PluginPorts {
            audio_in: vec!["in_1".into(), "in_2".into()],
            audio_out: vec!["out_1".into(), "out_2".into()],
            ..Default::default()
        };
        self.common
            .set_hints(PluginHints::CAN_DRYWET | PluginHints::CAN_VOLUME);
        Ok(())
    }

    fn process(&self, ctx: &mut ProcessContext<'_>) {
        let frames = ctx.frames as usize;
        for (input, output) in ctx.audio_in.iter().zip(ctx.audio_out.iter_mut()) {
            for (o, i) in output[..frames].iter_mut().zip(&input[..frames]) {
                *o = i * 0.5;
            }
        }
    }
}
