//! Common types shared between backends

use std::path::PathBuf;

use bitflags::bitflags;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a loaded shader program (all of its stages)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderHandle(pub(crate) u64);

/// Handle to an immutable pipeline state object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a render pass declaration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer (physical attachment binding)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a resource table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceTableHandle(pub(crate) u64);

/// Handle to a finalized vertex format registered with a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexFormatHandle(pub(crate) u64);

macro_rules! impl_handle_id {
    ($($handle:ty),* $(,)?) => {
        $(
            impl $handle {
                /// Raw backend id, stable for the lifetime of the resource
                pub fn id(&self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

impl_handle_id!(
    BufferHandle,
    TextureHandle,
    SamplerHandle,
    ShaderHandle,
    PipelineHandle,
    RenderPassHandle,
    FramebufferHandle,
    ResourceTableHandle,
    VertexFormatHandle,
);

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
    Depth24PlusStencil8,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth32Float | TextureFormat::Depth24PlusStencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Depth32Float
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::R32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

bitflags! {
    /// Texture usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const COPY_SRC = 1 << 0;
        const COPY_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_TARGET = 1 << 4;
        const DEPTH_TARGET = 1 << 5;
    }
}

bitflags! {
    /// Buffer usage flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
        const MAP_READ = 1 << 6;
    }
}

bitflags! {
    /// Pipeline stages present in a shader program
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
        const VERTEX_FRAGMENT = Self::VERTEX.bits() | Self::FRAGMENT.bits();
    }
}

bitflags! {
    /// Color channel write mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ColorWrites: u32 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = 0xF;
    }
}

/// Tracked resource state of a texture
///
/// Explicit backends translate these into image layouts or resource states;
/// the immediate backend only records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureState {
    Undefined,
    Common,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderRead,
    CopySrc,
    CopyDst,
    Present,
}

impl TextureState {
    pub fn is_shader_readable(&self) -> bool {
        matches!(self, TextureState::ShaderRead | TextureState::DepthRead)
    }

    /// State an attachment of `format` must be in while a pass writes it
    pub fn attachment_for(format: TextureFormat) -> Self {
        if format.is_depth() {
            TextureState::DepthWrite
        } else {
            TextureState::RenderTarget
        }
    }
}

/// Attachment load behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Clear,
    Load,
    DontCare,
}

/// Attachment store behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

/// Clear value of one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const TRANSPARENT_BLACK: Self = Self::Color([0.0, 0.0, 0.0, 0.0]);
    pub const OPAQUE_BLACK: Self = Self::Color([0.0, 0.0, 0.0, 1.0]);
    pub const DEPTH_ONE: Self = Self::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };

    /// Clear value used when a texture is created without one
    pub fn default_for(format: TextureFormat) -> Self {
        if format.is_depth() {
            Self::DEPTH_ONE
        } else {
            Self::TRANSPARENT_BLACK
        }
    }

    pub fn color(&self) -> [f32; 4] {
        match self {
            ClearValue::Color(c) => *c,
            ClearValue::DepthStencil { depth, .. } => [*depth, 0.0, 0.0, 0.0],
        }
    }

    pub fn depth(&self) -> f32 {
        match self {
            ClearValue::Color(c) => c[0],
            ClearValue::DepthStencil { depth, .. } => *depth,
        }
    }

    pub fn stencil(&self) -> u32 {
        match self {
            ClearValue::Color(_) => 0,
            ClearValue::DepthStencil { stencil, .. } => *stencil,
        }
    }
}

/// Viewport rectangle plus depth range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub fn scissor(&self) -> ScissorRect {
        ScissorRect {
            x: self.x.max(0.0) as u32,
            y: self.y.max(0.0) as u32,
            width: self.width.max(0.0) as u32,
            height: self.height.max(0.0) as u32,
        }
    }
}

/// Scissor rectangle in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// One declared attachment of a render pass
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentDesc {
    pub format: TextureFormat,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

impl AttachmentDesc {
    pub fn clear_store(format: TextureFormat) -> Self {
        Self {
            format,
            load_op: LoadOp::Clear,
            store_op: StoreOp::Store,
        }
    }

    pub fn load_store(format: TextureFormat) -> Self {
        Self {
            format,
            load_op: LoadOp::Load,
            store_op: StoreOp::Store,
        }
    }
}

/// Render pass declaration
#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub label: Option<String>,
    pub color_attachments: Vec<AttachmentDesc>,
    pub depth_attachment: Option<AttachmentDesc>,
    pub viewport: Viewport,
}

impl RenderPassDesc {
    pub fn color_formats(&self) -> Vec<TextureFormat> {
        self.color_attachments.iter().map(|a| a.format).collect()
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_attachment.map(|a| a.format)
    }

    pub fn attachment_count(&self) -> usize {
        self.color_attachments.len() + usize::from(self.depth_attachment.is_some())
    }
}

/// Physical targets bound to a render pass
#[derive(Debug, Clone)]
pub struct FramebufferDesc {
    pub label: Option<String>,
    pub pass: RenderPassHandle,
    pub color_targets: Vec<TextureHandle>,
    pub depth_target: Option<TextureHandle>,
}

impl FramebufferDesc {
    pub fn attachments(&self) -> impl Iterator<Item = TextureHandle> + '_ {
        self.color_targets.iter().copied().chain(self.depth_target)
    }
}

/// Texture descriptor
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
    pub initial_state: TextureState,
    pub clear_value: Option<ClearValue>,
}

impl Default for TextureDesc {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            mip_levels: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::SAMPLED | TextureUsage::COPY_DST,
            initial_state: TextureState::ShaderRead,
            clear_value: None,
        }
    }
}

impl TextureDesc {
    /// A sampled render target of the given size and format
    pub fn render_target(
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> Self {
        let target = if format.is_depth() {
            TextureUsage::DEPTH_TARGET
        } else {
            TextureUsage::COLOR_TARGET
        };
        Self {
            label: Some(label.to_string()),
            width: width.max(1),
            height: height.max(1),
            mip_levels: 1,
            format,
            usage: target | TextureUsage::SAMPLED,
            initial_state: TextureState::ShaderRead,
            clear_value: None,
        }
    }

    pub fn byte_size(&self) -> usize {
        (self.width * self.height * self.format.bytes_per_pixel()) as usize
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: Option<String>,
    pub count: u64,
    pub element_size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    /// Requested size before backend alignment
    pub fn requested_size(&self) -> u64 {
        self.count * self.element_size
    }
}

/// Filter mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// Address mode for samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Compare function for depth tests and comparison samplers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Sampler descriptor
#[derive(Debug, Clone)]
pub struct SamplerDesc {
    pub label: Option<String>,
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_mode: AddressMode,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            label: None,
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
            compare: None,
        }
    }
}

impl SamplerDesc {
    pub fn point_clamp() -> Self {
        Self {
            label: Some("point_clamp".into()),
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            ..Default::default()
        }
    }

    pub fn linear_wrap() -> Self {
        Self {
            label: Some("linear_wrap".into()),
            address_mode: AddressMode::Repeat,
            ..Default::default()
        }
    }
}

/// Shader program load request
///
/// `path_stem` is `<root>/data/shaders/<name>`; each backend appends its own
/// extension (and per-stage suffix where it needs one).
#[derive(Debug, Clone)]
pub struct ShaderDesc {
    pub label: String,
    pub path_stem: PathBuf,
    pub stages: ShaderStageFlags,
}

/// Semantic of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeSemantic {
    Position,
    Normal,
    Tangent,
    Binormal,
    Color,
    Uv,
    Joints,
    Weights,
}

/// Element format of one vertex attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32x4,
}

impl AttributeFormat {
    pub fn component_count(&self) -> u32 {
        match self {
            AttributeFormat::Float32 => 1,
            AttributeFormat::Float32x2 => 2,
            AttributeFormat::Float32x3 => 3,
            AttributeFormat::Float32x4 | AttributeFormat::Uint32x4 => 4,
        }
    }

    pub fn component_size(&self) -> u32 {
        4
    }

    pub fn size(&self) -> u32 {
        self.component_count() * self.component_size()
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, AttributeFormat::Uint32x4)
    }
}

/// One attribute of a finalized vertex layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub semantic: AttributeSemantic,
    pub format: AttributeFormat,
    pub location: u32,
    pub offset: u32,
}

/// Finalized vertex layout handed to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

/// Topology class a pipeline is compiled for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopologyType {
    Point,
    Line,
    Triangle,
}

impl PrimitiveTopology {
    pub fn topology_type(&self) -> PrimitiveTopologyType {
        match self {
            PrimitiveTopology::PointList => PrimitiveTopologyType::Point,
            PrimitiveTopology::LineList | PrimitiveTopology::LineStrip => {
                PrimitiveTopologyType::Line
            }
            PrimitiveTopology::TriangleList | PrimitiveTopology::TriangleStrip => {
                PrimitiveTopologyType::Triangle
            }
        }
    }
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

impl FrontFace {
    pub fn flipped(&self) -> Self {
        match self {
            FrontFace::Ccw => FrontFace::Cw,
            FrontFace::Cw => FrontFace::Ccw,
        }
    }
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Polygon fill mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    Solid,
    Wireframe,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state of a color target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    pub fn additive() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent::default(),
        }
    }
}

/// Blend description applied to every color target of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendDesc {
    pub alpha_to_coverage: bool,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl Default for BlendDesc {
    fn default() -> Self {
        Self {
            alpha_to_coverage: false,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }
}

/// Rasterizer description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterizerDesc {
    pub fill_mode: FillMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
}

impl Default for RasterizerDesc {
    fn default() -> Self {
        Self {
            fill_mode: FillMode::Solid,
            cull_mode: CullMode::Back,
            front_face: FrontFace::Ccw,
        }
    }
}

impl RasterizerDesc {
    pub fn no_cull() -> Self {
        Self {
            cull_mode: CullMode::None,
            ..Default::default()
        }
    }
}

/// Depth/stencil description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilDesc {
    pub depth_test: bool,
    pub depth_write: bool,
    pub compare: CompareFunction,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        Self {
            depth_test: false,
            depth_write: false,
            compare: CompareFunction::Less,
        }
    }
}

impl DepthStencilDesc {
    pub fn read_write() -> Self {
        Self {
            depth_test: true,
            depth_write: true,
            compare: CompareFunction::Less,
        }
    }
}

/// Number of resources of each category a pipeline expects
///
/// Textures and samplers come in pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResourceLayout {
    pub constant_buffers: u32,
    pub textures: u32,
    pub buffers: u32,
}

impl ResourceLayout {
    pub const EMPTY: Self = Self {
        constant_buffers: 0,
        textures: 0,
        buffers: 0,
    };

    pub fn new(constant_buffers: u32, textures: u32, buffers: u32) -> Self {
        Self {
            constant_buffers,
            textures,
            buffers,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

/// Shader binding number of the first sampler of a table
pub const SAMPLER_BINDING_OFFSET: u32 = 16;

/// Immutable pipeline state description
#[derive(Debug, Clone)]
pub struct PipelineStateDesc {
    pub label: Option<String>,
    pub shader: ShaderHandle,
    pub vertex_format: Option<VertexFormatHandle>,
    pub topology: PrimitiveTopology,
    pub blend: BlendDesc,
    pub rasterizer: RasterizerDesc,
    pub depth_stencil: DepthStencilDesc,
    pub color_formats: Vec<TextureFormat>,
    pub depth_format: Option<TextureFormat>,
    pub resource_layout: ResourceLayout,
    pub sample_count: u32,
}

impl PipelineStateDesc {
    /// Description with default fixed-function state targeting `pass`'s formats
    pub fn for_pass(label: &str, shader: ShaderHandle, pass: &RenderPassDesc) -> Self {
        Self {
            label: Some(label.to_string()),
            shader,
            vertex_format: None,
            topology: PrimitiveTopology::TriangleList,
            blend: BlendDesc::default(),
            rasterizer: RasterizerDesc::default(),
            depth_stencil: DepthStencilDesc::default(),
            color_formats: pass.color_formats(),
            depth_format: pass.depth_format(),
            resource_layout: ResourceLayout::EMPTY,
            sample_count: 1,
        }
    }

    pub fn topology_type(&self) -> PrimitiveTopologyType {
        self.topology.topology_type()
    }
}

/// Index format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(&self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

/// Vertex buffer binding of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: BufferHandle,
    pub offset: u64,
}

/// Index buffer binding of a draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer: BufferHandle,
    pub offset: u64,
    pub format: IndexFormat,
}

/// One draw issued inside a render pass
///
/// `element_count` counts indices when an index buffer is bound, vertices
/// otherwise. Draws without a vertex buffer generate vertices in the shader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawCommand {
    pub vertex_buffer: Option<VertexBufferView>,
    pub index_buffer: Option<IndexBufferView>,
    pub element_count: u32,
    pub instance_count: u32,
}

impl DrawCommand {
    /// Fullscreen triangle generated from the vertex index
    pub fn fullscreen() -> Self {
        Self {
            vertex_buffer: None,
            index_buffer: None,
            element_count: 3,
            instance_count: 1,
        }
    }
}

/// Contiguous run of descriptor slots in a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorRange {
    pub offset: u32,
    pub count: u32,
}

impl DescriptorRange {
    pub fn end(&self) -> u32 {
        self.offset + self.count
    }

    pub fn overlaps(&self, other: &DescriptorRange) -> bool {
        self.count > 0 && other.count > 0 && self.offset < other.end() && other.offset < self.end()
    }
}

/// Contents of a resource table as written to a backend
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTableDesc {
    pub constant_buffers: Vec<BufferHandle>,
    pub textures: Vec<TextureHandle>,
    pub samplers: Vec<SamplerHandle>,
    pub buffers: Vec<BufferHandle>,
    pub constant_buffer_range: Option<DescriptorRange>,
    pub texture_range: Option<DescriptorRange>,
    pub sampler_range: Option<DescriptorRange>,
    pub buffer_range: Option<DescriptorRange>,
}

impl ResourceTableDesc {
    pub fn layout(&self) -> ResourceLayout {
        ResourceLayout {
            constant_buffers: self.constant_buffers.len() as u32,
            textures: self.textures.len() as u32,
            buffers: self.buffers.len() as u32,
        }
    }

    /// Shader binding number of the `index`-th constant buffer
    pub fn constant_buffer_binding(&self, index: usize) -> u32 {
        index as u32
    }

    /// Shader binding number of the `index`-th texture
    pub fn texture_binding(&self, index: usize) -> u32 {
        (self.constant_buffers.len() + index) as u32
    }

    /// Shader binding number of the `index`-th sampler
    pub fn sampler_binding(&self, index: usize) -> u32 {
        SAMPLER_BINDING_OFFSET + index as u32
    }

    /// Shader binding number of the `index`-th raw buffer
    pub fn buffer_binding(&self, index: usize) -> u32 {
        (self.constant_buffers.len() + self.textures.len() + index) as u32
    }
}

/// Backbuffer acquired for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub backbuffer: TextureHandle,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_clear_to_one() {
        assert_eq!(
            ClearValue::default_for(TextureFormat::Depth32Float),
            ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0
            }
        );
        assert_eq!(
            ClearValue::default_for(TextureFormat::Rgba16Float),
            ClearValue::Color([0.0; 4])
        );
    }

    #[test]
    fn table_binding_numbers_follow_category_order() {
        let desc = ResourceTableDesc {
            constant_buffers: vec![BufferHandle(1), BufferHandle(2)],
            textures: vec![TextureHandle(3)],
            samplers: vec![SamplerHandle(4)],
            buffers: vec![BufferHandle(5)],
            ..Default::default()
        };
        assert_eq!(desc.constant_buffer_binding(1), 1);
        assert_eq!(desc.texture_binding(0), 2);
        assert_eq!(desc.buffer_binding(0), 3);
        assert_eq!(desc.sampler_binding(0), SAMPLER_BINDING_OFFSET);
        assert_eq!(desc.layout(), ResourceLayout::new(2, 1, 1));
    }

    #[test]
    fn descriptor_ranges_overlap() {
        let a = DescriptorRange { offset: 0, count: 4 };
        let b = DescriptorRange { offset: 4, count: 2 };
        let c = DescriptorRange { offset: 3, count: 2 };
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(!a.overlaps(&DescriptorRange { offset: 2, count: 0 }));
    }

    #[test]
    fn topology_classes() {
        assert_eq!(
            PrimitiveTopology::LineStrip.topology_type(),
            PrimitiveTopologyType::Line
        );
        assert_eq!(
            PrimitiveTopology::TriangleList.topology_type(),
            PrimitiveTopologyType::Triangle
        );
    }
}
