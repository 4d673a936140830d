//! Effect stage: named effect inputs and rendering through an effect engine.

pub mod definition;
mod wgpu_engine;

pub use definition::{EffectDefinition, InputDecl, InputType, ParamValue, ShaderLanguage};
pub use wgpu_engine::WgpuEffectEngine;

use crate::buffer::{Buffer, BufferDescriptor, BufferPool, Size};
use crate::error::EffectError;
use definition::MAX_PARAM_SLOTS;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Scalar inputs packed into uniform slots.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ParamBlock {
    pub slots: [[f32; 4]; MAX_PARAM_SLOTS],
}

/// Everything an engine needs for one render.
pub struct RenderRequest<'a> {
    pub input: &'a Buffer,
    pub output: &'a Buffer,
    pub params: ParamBlock,
    /// Seconds since the stage rendered its first frame
    pub time: f32,
    pub frame_index: u64,
}

/// Shader boundary: executes an effect graph against an input texture.
pub trait EffectEngine: Send {
    /// Render `request.input` into `request.output`. Synchronous from the
    /// caller's perspective.
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<(), EffectError>;
}

/// Shared, thread-safe view of an effect's input values.
///
/// Writes are last-write-wins per name and become visible to the next render.
#[derive(Clone)]
pub struct ParameterHandle {
    definition: Arc<EffectDefinition>,
    values: Arc<Mutex<HashMap<String, ParamValue>>>,
}

impl ParameterHandle {
    fn new(definition: Arc<EffectDefinition>) -> Self {
        Self {
            definition,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, ParamValue>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn definition(&self) -> &EffectDefinition {
        &self.definition
    }

    /// Set one named input.
    pub fn set(&self, name: &str, value: ParamValue) -> Result<(), EffectError> {
        let decl = self
            .definition
            .input(name)
            .ok_or_else(|| EffectError::UnknownInput(name.to_string()))?;
        let value = value.coerce(decl.ty).ok_or_else(|| EffectError::TypeMismatch {
            name: name.to_string(),
            expected: decl.ty.name(),
            actual: value.type_name(),
        })?;
        self.values().insert(name.to_string(), value);
        debug!("Effect input '{}' = {:?}", name, value);
        Ok(())
    }

    /// Map `t` in `[0, 1]` linearly onto the input's declared range.
    pub fn set_normalized(&self, name: &str, t: f32) -> Result<(), EffectError> {
        let decl = self
            .definition
            .input(name)
            .ok_or_else(|| EffectError::UnknownInput(name.to_string()))?;
        let (min, max) = decl.range();
        let t = t.clamp(0.0, 1.0);
        self.set(name, ParamValue::Float(min + (max - min) * t))
    }

    /// Current value of an input, falling back to its declared default.
    pub fn get(&self, name: &str) -> Option<ParamValue> {
        let decl = self.definition.input(name)?;
        self.values()
            .get(name)
            .copied()
            .or_else(|| decl.default.and_then(|d| d.coerce(decl.ty)))
    }

    /// Pack current values into uniform slots.
    pub fn pack(&self) -> Result<ParamBlock, EffectError> {
        let values = self.values();
        let mut block = ParamBlock {
            slots: [[0.0; 4]; MAX_PARAM_SLOTS],
        };
        for (slot, decl) in block.slots.iter_mut().zip(self.definition.scalar_inputs()) {
            let value = values
                .get(&decl.name)
                .copied()
                .or_else(|| decl.default.and_then(|d| d.coerce(decl.ty)))
                .ok_or_else(|| EffectError::MissingInput(decl.name.clone()))?;
            *slot = value.to_slot();
        }
        Ok(block)
    }
}

/// Adapter between the pipeline and an [`EffectEngine`].
pub struct EffectStage {
    engine: Box<dyn EffectEngine>,
    pool: Arc<BufferPool>,
    parameters: ParameterHandle,
    output: BufferDescriptor,
    started: Option<std::time::Instant>,
    frame_index: u64,
}

impl EffectStage {
    pub fn new(
        definition: EffectDefinition,
        engine: Box<dyn EffectEngine>,
        pool: Arc<BufferPool>,
        output_size: Size,
    ) -> Self {
        Self {
            engine,
            pool,
            parameters: ParameterHandle::new(Arc::new(definition)),
            output: BufferDescriptor::texture(output_size),
            started: None,
            frame_index: 0,
        }
    }

    pub fn definition(&self) -> &EffectDefinition {
        self.parameters.definition()
    }

    /// Handle for updating inputs from other threads.
    pub fn parameters(&self) -> ParameterHandle {
        self.parameters.clone()
    }

    pub fn set_parameter(&self, name: &str, value: ParamValue) -> Result<(), EffectError> {
        self.parameters.set(name, value)
    }

    pub fn output_size(&self) -> Size {
        self.output.size
    }

    /// Render `input` through the effect into a freshly acquired buffer.
    ///
    /// On failure the output buffer is released before returning.
    pub fn render(&mut self, input: &Buffer) -> Result<Buffer, EffectError> {
        let params = self.parameters.pack()?;
        let output = self.pool.acquire(&self.output)?;
        self.pool.timestamp(input);

        let started = *self.started.get_or_insert_with(std::time::Instant::now);
        let request = RenderRequest {
            input,
            output: &output,
            params,
            time: started.elapsed().as_secs_f32(),
            frame_index: self.frame_index,
        };
        self.engine.render(&request)?;
        self.frame_index += 1;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{PoolConfig, SurfaceId};
    use crate::testing::{RecordingAllocator, RecordingEngine};
    use std::thread;

    const DEF: &str = r#"
name: Glow
inputs:
  - {name: inputImage, type: image}
  - {name: intensity, type: float, min: 0.0, max: 4.0, default: 0.0}
  - {name: enabled, type: bool}
"#;

    fn stage(engine: RecordingEngine) -> (EffectStage, Arc<BufferPool>) {
        let allocator = RecordingAllocator::new();
        allocator.add_surface(SurfaceId(1), Size::new(64, 64));
        let pool = BufferPool::new(Box::new(allocator), PoolConfig::default());
        let definition = EffectDefinition::from_yaml(DEF).unwrap();
        let stage = EffectStage::new(definition, Box::new(engine), pool.clone(), Size::new(32, 16));
        (stage, pool)
    }

    #[test]
    fn test_unknown_and_mistyped_inputs_rejected() {
        let (stage, _) = stage(RecordingEngine::new());
        assert!(matches!(
            stage.set_parameter("radius", ParamValue::Float(1.0)),
            Err(EffectError::UnknownInput(_))
        ));
        assert!(matches!(
            stage.set_parameter("enabled", ParamValue::Float(1.0)),
            Err(EffectError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_required_input_fails_render_without_leak() {
        let engine = RecordingEngine::new();
        let (mut stage, pool) = stage(engine.clone());
        let input = pool.import_external(SurfaceId(1)).unwrap();

        let result = stage.render(&input);
        assert!(matches!(result, Err(EffectError::MissingInput(name)) if name == "enabled"));
        assert_eq!(engine.renders(), 0);
        drop(input);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_render_uses_latest_value_set_from_other_thread() {
        let engine = RecordingEngine::new();
        let (mut stage, pool) = stage(engine.clone());
        stage.set_parameter("enabled", ParamValue::Bool(true)).unwrap();
        stage.set_parameter("intensity", ParamValue::Float(0.1)).unwrap();

        let params = stage.parameters();
        thread::spawn(move || params.set("intensity", ParamValue::Float(0.5)).unwrap())
            .join()
            .unwrap();

        let input = pool.import_external(SurfaceId(1)).unwrap();
        let output = stage.render(&input).unwrap();
        assert_eq!(output.size(), Size::new(32, 16));
        assert!(!output.is_external());

        let block = engine.last_params().unwrap();
        assert_eq!(block.slots[0][0], 0.5);
        assert_eq!(block.slots[1][0], 1.0);
    }

    #[test]
    fn test_engine_failure_releases_output() {
        let engine = RecordingEngine::new();
        engine.fail_renders(true);
        let (mut stage, pool) = stage(engine);
        stage.set_parameter("enabled", ParamValue::Bool(false)).unwrap();
        let input = pool.import_external(SurfaceId(1)).unwrap();

        assert!(matches!(stage.render(&input), Err(EffectError::Engine(_))));
        assert_eq!(pool.stats().in_use, 1);
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_normalized_slider_maps_to_declared_range() {
        let (stage, _) = stage(RecordingEngine::new());
        let params = stage.parameters();
        params.set_normalized("intensity", 0.25).unwrap();
        assert_eq!(params.get("intensity"), Some(ParamValue::Float(1.0)));
        params.set_normalized("intensity", 3.0).unwrap();
        assert_eq!(params.get("intensity"), Some(ParamValue::Float(4.0)));
    }

    #[test]
    fn test_defaults_fill_unset_inputs() {
        let (stage, _) = stage(RecordingEngine::new());
        let params = stage.parameters();
        assert_eq!(params.get("intensity"), Some(ParamValue::Float(0.0)));
        assert_eq!(params.get("enabled"), None);
    }
}
