//! Declarative effect definitions loaded from YAML.
//!
//! ```yaml
//! name: Glow
//! inputs:
//!   - name: inputImage
//!     type: image
//!   - name: intensity
//!     type: float
//!     min: 0.0
//!     max: 1.0
//!     default: 0.0
//! language: glsl
//! shader: |
//!   #version 450
//!   ...
//! ```
//!
//! Scalar inputs occupy one `vec4` slot each in the `Params` uniform block
//! (binding 3), in declaration order.

use crate::error::EffectError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Maximum number of scalar inputs an effect may declare.
pub const MAX_PARAM_SLOTS: usize = 16;

/// Default name of the designated image input.
pub const DEFAULT_IMAGE_INPUT: &str = "inputImage";

/// Type of an effect input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Float,
    Bool,
    Long,
    Point2d,
    Color,
    Image,
}

impl InputType {
    pub fn name(&self) -> &'static str {
        match self {
            InputType::Float => "float",
            InputType::Bool => "bool",
            InputType::Long => "long",
            InputType::Point2d => "point2d",
            InputType::Color => "color",
            InputType::Image => "image",
        }
    }
}

/// Value of a scalar effect input.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Float(f32),
    Long(i32),
    Point([f32; 2]),
    Color([f32; 4]),
}

impl ParamValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ParamValue::Bool(_) => "bool",
            ParamValue::Float(_) => "float",
            ParamValue::Long(_) => "long",
            ParamValue::Point(_) => "point2d",
            ParamValue::Color(_) => "color",
        }
    }

    /// Convert to the representation `ty` expects, if compatible.
    pub fn coerce(self, ty: InputType) -> Option<ParamValue> {
        match (ty, self) {
            (InputType::Float, ParamValue::Float(v)) => Some(ParamValue::Float(v)),
            (InputType::Float, ParamValue::Long(v)) => Some(ParamValue::Float(v as f32)),
            (InputType::Long, ParamValue::Long(v)) => Some(ParamValue::Long(v)),
            (InputType::Long, ParamValue::Float(v)) => Some(ParamValue::Long(v.round() as i32)),
            (InputType::Bool, ParamValue::Bool(v)) => Some(ParamValue::Bool(v)),
            (InputType::Point2d, ParamValue::Point(v)) => Some(ParamValue::Point(v)),
            (InputType::Color, ParamValue::Color(v)) => Some(ParamValue::Color(v)),
            _ => None,
        }
    }

    /// Uniform-slot representation.
    pub fn to_slot(&self) -> [f32; 4] {
        match *self {
            ParamValue::Bool(v) => [if v { 1.0 } else { 0.0 }, 0.0, 0.0, 0.0],
            ParamValue::Float(v) => [v, 0.0, 0.0, 0.0],
            ParamValue::Long(v) => [v as f32, 0.0, 0.0, 0.0],
            ParamValue::Point([x, y]) => [x, y, 0.0, 0.0],
            ParamValue::Color(c) => c,
        }
    }
}

/// One declared effect input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: InputType,
    #[serde(default)]
    pub min: Option<f32>,
    #[serde(default)]
    pub max: Option<f32>,
    #[serde(default)]
    pub default: Option<ParamValue>,
}

impl InputDecl {
    /// Declared numeric range, `[0, 1]` when unspecified.
    pub fn range(&self) -> (f32, f32) {
        (self.min.unwrap_or(0.0), self.max.unwrap_or(1.0))
    }
}

/// Shader language of an effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShaderLanguage {
    #[default]
    Glsl,
    Wgsl,
}

/// A named, parameterized image transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_image_input")]
    pub image_input: String,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub language: ShaderLanguage,
    /// Fragment shader source; empty means passthrough.
    #[serde(default)]
    pub shader: String,
}

fn default_image_input() -> String {
    DEFAULT_IMAGE_INPUT.to_string()
}

impl EffectDefinition {
    /// Effect that copies its input unchanged.
    pub fn passthrough() -> Self {
        Self {
            name: "Passthrough".into(),
            description: String::new(),
            image_input: default_image_input(),
            inputs: Vec::new(),
            language: ShaderLanguage::Wgsl,
            shader: String::new(),
        }
    }

    pub fn from_yaml(source: &str) -> Result<Self, EffectError> {
        let definition: EffectDefinition =
            serde_yaml::from_str(source).map_err(|e| EffectError::Definition(e.to_string()))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, EffectError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| EffectError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&source)
    }

    fn validate(&self) -> Result<(), EffectError> {
        let mut seen = std::collections::HashSet::new();
        for input in &self.inputs {
            if !seen.insert(input.name.as_str()) {
                return Err(EffectError::Definition(format!(
                    "input '{}' declared twice",
                    input.name
                )));
            }
            if input.ty == InputType::Image && input.name != self.image_input {
                return Err(EffectError::Definition(format!(
                    "image input '{}' is not the designated image input '{}'",
                    input.name, self.image_input
                )));
            }
            if let Some(default) = input.default {
                if default.coerce(input.ty).is_none() {
                    return Err(EffectError::Definition(format!(
                        "default for '{}' is {}, expected {}",
                        input.name,
                        default.type_name(),
                        input.ty.name()
                    )));
                }
            }
        }
        let slots = self.scalar_inputs().count();
        if slots > MAX_PARAM_SLOTS {
            return Err(EffectError::Definition(format!(
                "{} scalar inputs declared, at most {} supported",
                slots, MAX_PARAM_SLOTS
            )));
        }
        Ok(())
    }

    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Non-image inputs in uniform-slot order.
    pub fn scalar_inputs(&self) -> impl Iterator<Item = &InputDecl> {
        self.inputs.iter().filter(|i| i.ty != InputType::Image)
    }
}
