//! wgpu-based effect engine.

use super::definition::{EffectDefinition, ShaderLanguage};
use super::{EffectEngine, ParamBlock, RenderRequest};
use crate::error::EffectError;
use crate::gpu::{CurrentLock, GpuContext, TextureTable};
use bytemuck::{Pod, Zeroable};
use naga::front::glsl::{Frontend, Options};
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::ShaderStage;
use std::borrow::Cow;
use tracing::info;
use wgpu::util::DeviceExt;

/// Default vertex shader in WGSL.
const VERTEX_SHADER: &str = r#"
struct VertexInput {
    @location(0) position: vec2<f32>,
    @location(1) tex_coords: vec2<f32>,
}

struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) tex_coords: vec2<f32>,
}

@vertex
fn vs_main(in: VertexInput) -> VertexOutput {
    var out: VertexOutput;
    out.clip_position = vec4<f32>(in.position, 0.0, 1.0);
    out.tex_coords = in.tex_coords;
    return out;
}
"#;

/// Default passthrough fragment shader in WGSL.
const DEFAULT_FRAGMENT_SHADER: &str = r#"
@group(0) @binding(0) var t_texture: texture_2d<f32>;
@group(0) @binding(1) var s_sampler: sampler;

@fragment
fn fs_main(@location(0) tex_coords: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(t_texture, s_sampler, tex_coords);
}
"#;

/// Built-in uniforms at binding 2.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Uniforms {
    pub time: f32,
    pub width: f32,
    pub height: f32,
    pub frame: f32,
}

/// Vertex for rendering a full-screen quad.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct QuadVertex {
    position: [f32; 2],
    tex_coords: [f32; 2],
}

impl QuadVertex {
    const VERTICES: &'static [QuadVertex] = &[
        QuadVertex { position: [-1.0, -1.0], tex_coords: [0.0, 1.0] },
        QuadVertex { position: [1.0, -1.0], tex_coords: [1.0, 1.0] },
        QuadVertex { position: [1.0, 1.0], tex_coords: [1.0, 0.0] },
        QuadVertex { position: [-1.0, 1.0], tex_coords: [0.0, 0.0] },
    ];

    const INDICES: &'static [u16] = &[0, 1, 2, 2, 3, 0];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &[
                wgpu::VertexAttribute {
                    offset: 0,
                    shader_location: 0,
                    format: wgpu::VertexFormat::Float32x2,
                },
                wgpu::VertexAttribute {
                    offset: std::mem::size_of::<[f32; 2]>() as wgpu::BufferAddress,
                    shader_location: 1,
                    format: wgpu::VertexFormat::Float32x2,
                },
            ],
        }
    }
}

/// Resolve the fragment shader of a definition to WGSL and its entry point.
fn fragment_source(definition: &EffectDefinition) -> Result<(String, &'static str), EffectError> {
    if definition.shader.trim().is_empty() {
        return Ok((DEFAULT_FRAGMENT_SHADER.to_string(), "fs_main"));
    }
    match definition.language {
        ShaderLanguage::Glsl => Ok((glsl_to_wgsl(&definition.shader)?, "main")),
        ShaderLanguage::Wgsl => {
            naga::front::wgsl::parse_str(&definition.shader)
                .map_err(|e| EffectError::Shader(format!("WGSL parse error: {}", e)))?;
            Ok((definition.shader.clone(), "fs_main"))
        }
    }
}

/// Converts a GLSL fragment shader to WGSL.
fn glsl_to_wgsl(glsl: &str) -> Result<String, EffectError> {
    let mut frontend = Frontend::default();
    let options = Options::from(ShaderStage::Fragment);
    let module = frontend
        .parse(&options, glsl)
        .map_err(|e| EffectError::Shader(format!("GLSL parse error: {:?}", e)))?;

    let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
    let info = validator
        .validate(&module)
        .map_err(|e| EffectError::Shader(format!("Shader validation error: {:?}", e)))?;
    naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
        .map_err(|e| EffectError::Shader(format!("WGSL generation error: {:?}", e)))
}

/// Renders one effect as a single full-screen pass.
///
/// Textures are looked up by native handle in the shared [`TextureTable`],
/// so pooled and imported buffers are sampled without copies.
pub struct WgpuEffectEngine {
    device: wgpu::Device,
    queue: wgpu::Queue,
    current: CurrentLock,
    table: TextureTable,
    render_pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    uniform_buffer: wgpu::Buffer,
    params_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
}

impl WgpuEffectEngine {
    pub fn new(
        context: &GpuContext,
        table: TextureTable,
        definition: &EffectDefinition,
    ) -> Result<Self, EffectError> {
        let device = context.device.clone();
        let (fragment_wgsl, fragment_entry_point) = fragment_source(definition)?;

        let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Vertex Shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(VERTEX_SHADER)),
        });
        let fragment_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{} Fragment Shader", definition.name)),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(fragment_wgsl)),
        });

        let uniform_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Effect Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                uniform_entry(2),
                uniform_entry(3),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Effect Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            immediate_size: 0,
        });

        let render_pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{} Render Pipeline", definition.name)),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &vertex_module,
                entry_point: Some("vs_main"),
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &fragment_module,
                entry_point: Some(fragment_entry_point),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview_mask: None,
            cache: None,
        });

        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Vertex Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Index Buffer"),
            contents: bytemuck::cast_slice(QuadVertex::INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Uniform Buffer"),
            contents: bytemuck::cast_slice(&[Uniforms::zeroed()]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Params Buffer"),
            contents: bytemuck::cast_slice(&[ParamBlock::zeroed()]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Texture Sampler"),
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        info!("Effect '{}' compiled", definition.name);

        Ok(Self {
            device,
            queue: context.queue.clone(),
            current: context.current.clone(),
            table,
            render_pipeline,
            bind_group_layout,
            vertex_buffer,
            index_buffer,
            uniform_buffer,
            params_buffer,
            sampler,
        })
    }

    fn texture(&self, handle: crate::buffer::NativeHandle) -> Result<wgpu::Texture, EffectError> {
        self.table
            .get(handle)
            .ok_or_else(|| EffectError::Engine(format!("texture {:?} is not resident", handle)))
    }
}

impl EffectEngine for WgpuEffectEngine {
    fn render(&mut self, request: &RenderRequest<'_>) -> Result<(), EffectError> {
        let input = self.texture(request.input.handle())?;
        let output = self.texture(request.output.handle())?;
        if output.format() != wgpu::TextureFormat::Rgba8Unorm {
            return Err(EffectError::Engine(format!(
                "output texture format {:?} is not renderable by this effect",
                output.format()
            )));
        }

        let _current = self.current.make_current();
        let uniforms = Uniforms {
            time: request.time,
            width: output.width() as f32,
            height: output.height() as f32,
            frame: request.frame_index as f32,
        };
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::cast_slice(&[uniforms]));
        self.queue
            .write_buffer(&self.params_buffer, 0, bytemuck::cast_slice(&[request.params]));

        let input_view = input.create_view(&wgpu::TextureViewDescriptor::default());
        let output_view = output.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Effect Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(&input_view) },
                wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&self.sampler) },
                wgpu::BindGroupEntry { binding: 2, resource: self.uniform_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 3, resource: self.params_buffer.as_entire_binding() },
            ],
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Effect Encoder"),
        });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Effect Pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output_view,
                    resolve_target: None,
                    ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::BLACK), store: wgpu::StoreOp::Store },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });
            render_pass.set_pipeline(&self.render_pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            render_pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            render_pass.draw_indexed(0..6, 0, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLSL_TINT: &str = r#"#version 450
layout(set = 0, binding = 0) uniform texture2D t_texture;
layout(set = 0, binding = 1) uniform sampler s_sampler;
layout(set = 0, binding = 3) uniform Params {
    vec4 slots[16];
};
layout(location = 0) in vec2 v_tex_coords;
layout(location = 0) out vec4 f_color;

void main() {
    vec4 color = texture(sampler2D(t_texture, s_sampler), v_tex_coords);
    f_color = vec4(color.rgb * slots[0].x, color.a);
}
"#;

    #[test]
    fn test_glsl_translates_to_wgsl() {
        let wgsl = glsl_to_wgsl(GLSL_TINT).unwrap();
        assert!(wgsl.contains("fn main"));
        assert!(naga::front::wgsl::parse_str(&wgsl).is_ok());
    }

    #[test]
    fn test_bundled_glow_effect_compiles() {
        let def = EffectDefinition::from_yaml(include_str!("../../effects/glow.yaml")).unwrap();
        let (wgsl, entry) = fragment_source(&def).unwrap();
        assert_eq!(entry, "main");
        assert!(naga::front::wgsl::parse_str(&wgsl).is_ok());
    }

    #[test]
    fn test_invalid_glsl_is_shader_error() {
        let result = glsl_to_wgsl("#version 450\nvoid main() { undefined_call(); }\n");
        assert!(matches!(result, Err(EffectError::Shader(_))));
    }

    #[test]
    fn test_empty_shader_uses_passthrough() {
        let (source, entry) = fragment_source(&EffectDefinition::passthrough()).unwrap();
        assert_eq!(entry, "fs_main");
        assert!(naga::front::wgsl::parse_str(&source).is_ok());
    }

    #[test]
    fn test_invalid_wgsl_rejected_before_device() {
        let mut def = EffectDefinition::passthrough();
        def.shader = "fn fs_main( {".into();
        assert!(matches!(fragment_source(&def), Err(EffectError::Shader(_))));
    }

    #[test]
    fn test_uniform_layouts_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<Uniforms>(), 16);
        assert_eq!(std::mem::size_of::<ParamBlock>(), 256);
    }
}
