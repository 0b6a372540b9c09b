//! Render context integration tests.
//!
//! These drive [`RenderContext`] over the headless backend and check the
//! bookkeeping it does for every backend: buffer sizing, framebuffer
//! validation, resource table slots and texture state transitions.

mod common;

use rstest::rstest;

use common::TestContext;
use prism_render::backend::{
    AttributeFormat, AttributeSemantic, BufferUsage, ClearValue, FramebufferDesc, SamplerDesc, TextureFormat,
    TextureState,
};
use prism_render::backend::headless::RecordedCommand;
use prism_render::resources::{TextureLoader, VertexFormat};
use prism_render::{BackendType, RenderError};

// ============================================================================
// Vertex formats
// ============================================================================

#[rstest]
#[case::mesh(VertexFormat::mesh(), 60)]
#[case::skinned(VertexFormat::skinned(), 92)]
#[case::position_color(VertexFormat::position_color(), 24)]
fn vertex_format_stride(#[case] format: VertexFormat, #[case] stride: u32) {
    assert_eq!(format.stride(), stride);
    let layout = format.layout().unwrap();
    let mut expected_offset = 0;
    for (location, attribute) in layout.attributes.iter().enumerate() {
        assert_eq!(attribute.location, location as u32);
        assert_eq!(attribute.offset, expected_offset);
        expected_offset += attribute.format.size();
    }
    assert_eq!(expected_offset, stride);
}

#[test]
fn empty_vertex_format_is_rejected() {
    let mut t = TestContext::new(64, 64);
    let mut empty = VertexFormat::new();
    assert!(matches!(
        t.ctx.create_vertex_format(&mut empty),
        Err(RenderError::UnfinalizedVertexFormat)
    ));

    let mut format = VertexFormat::new().with(AttributeSemantic::Position, AttributeFormat::Float32x3);
    assert!(!format.is_finalized());
    let handle = t.ctx.create_vertex_format(&mut format).unwrap();
    assert!(format.is_finalized());
    assert_eq!(t.ctx.vertex_layout(handle).map(|l| l.stride), Some(12));
}

#[test]
fn non_joint_integer_attributes_are_rejected() {
    let mut t = TestContext::new(64, 64);
    let mut format = VertexFormat::new()
        .with(AttributeSemantic::Position, AttributeFormat::Float32x3)
        .with(AttributeSemantic::Joints, AttributeFormat::Float32x4)
        .with(AttributeSemantic::Color, AttributeFormat::Uint32x4);
    assert!(matches!(
        t.ctx.create_vertex_format(&mut format),
        Err(RenderError::InvalidFormatCombination(_))
    ));
    assert!(!format.is_finalized());

    let mut skinned = VertexFormat::skinned();
    assert!(t.ctx.create_vertex_format(&mut skinned).is_ok());
}

// ============================================================================
// Buffers
// ============================================================================

#[rstest]
#[case::uniform(BufferUsage::UNIFORM, 256)]
#[case::vertex(BufferUsage::VERTEX, 200)]
#[case::storage(BufferUsage::STORAGE, 200)]
fn buffer_round_trip(#[case] usage: BufferUsage, #[case] allocated: u64) {
    let mut t = TestContext::new(64, 64);
    let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
    let buffer = t.ctx.create_buffer_with_data(&data, 4, usage, "round trip").unwrap();
    assert_eq!(t.ctx.buffer_size(buffer), Some(allocated));

    let read = t.ctx.read_buffer(buffer).unwrap();
    assert_eq!(&read[..data.len()], data.as_slice());

    t.ctx.update_buffer(buffer, 8, &[0xAA; 4]).unwrap();
    let read = t.ctx.read_buffer(buffer).unwrap();
    assert_eq!(&read[8..12], &[0xAA; 4]);
    assert_eq!(read[12], 12);
}

#[test]
fn out_of_bounds_update_is_rejected() {
    let mut t = TestContext::new(64, 64);
    let buffer = t.ctx.create_buffer(4, 4, BufferUsage::VERTEX, "small").unwrap();
    assert!(t.ctx.update_buffer(buffer, 12, &[0; 8]).is_err());
    assert!(t.ctx.create_buffer(0, 16, BufferUsage::VERTEX, "empty").is_err());
}

// ============================================================================
// Framebuffers and passes
// ============================================================================

#[test]
fn framebuffer_format_mismatch_is_rejected() {
    let mut t = TestContext::new(64, 64);
    let pass = t.render_pass("hdr", &[TextureFormat::Rgba16Float], None, 32, 32);
    let wrong = t.render_target("ldr", 32, 32, TextureFormat::Rgba8Unorm);

    let result = t.ctx.create_framebuffer(&FramebufferDesc {
        label: Some("mismatch".into()),
        pass,
        color_targets: vec![wrong],
        depth_target: None,
    });
    assert!(matches!(result, Err(RenderError::InvalidFormatCombination(_))));
}

#[test]
fn framebuffer_attachment_count_must_match() {
    let mut t = TestContext::new(64, 64);
    let pass = t.render_pass(
        "gbuffer",
        &[TextureFormat::Rgba8Unorm],
        Some(TextureFormat::Depth32Float),
        32,
        32,
    );
    let color = t.render_target("color", 32, 32, TextureFormat::Rgba8Unorm);

    let result = t.ctx.create_framebuffer(&FramebufferDesc {
        label: Some("no depth".into()),
        pass,
        color_targets: vec![color],
        depth_target: None,
    });
    assert!(matches!(result, Err(RenderError::InvalidFormatCombination(_))));
}

#[test]
fn end_render_pass_leaves_each_attachment_shader_readable_once() {
    let mut t = TestContext::new(64, 64);
    let colors = [TextureFormat::Rgba8Unorm, TextureFormat::Rgba16Float];
    let pass = t.render_pass("mrt", &colors, Some(TextureFormat::Depth32Float), 32, 32);
    let albedo = t.render_target("albedo", 32, 32, colors[0]);
    let normal = t.render_target("normal", 32, 32, colors[1]);
    let depth = t.render_target("depth", 32, 32, TextureFormat::Depth32Float);
    let framebuffer = t
        .ctx
        .create_framebuffer(&FramebufferDesc {
            label: Some("mrt".into()),
            pass,
            color_targets: vec![albedo, normal],
            depth_target: Some(depth),
        })
        .unwrap();

    t.ctx.begin_frame().unwrap();
    t.ctx.begin_render_pass(pass, framebuffer, &[]).unwrap();
    assert_eq!(t.ctx.texture_state(albedo), Some(TextureState::RenderTarget));
    assert_eq!(t.ctx.texture_state(depth), Some(TextureState::DepthWrite));
    t.ctx.end_render_pass().unwrap();
    t.ctx.end_frame().unwrap();

    let commands = t.headless().commands();
    let end = commands
        .iter()
        .position(|c| matches!(c, RecordedCommand::EndRenderPass(_)))
        .unwrap();
    let after_pass: Vec<_> = commands[end..]
        .iter()
        .filter_map(|c| match c {
            RecordedCommand::Transition {
                texture,
                after: TextureState::ShaderRead,
                ..
            } => Some(*texture),
            _ => None,
        })
        .collect();
    assert_eq!(after_pass.len(), 3);
    for texture in [albedo, normal, depth] {
        assert_eq!(after_pass.iter().filter(|t| **t == texture).count(), 1);
        assert_eq!(t.ctx.texture_state(texture), Some(TextureState::ShaderRead));
    }
    assert_eq!(t.headless().state_mismatches(), 0);
}

#[test]
fn explicit_clear_values_are_forwarded() {
    let mut t = TestContext::new(64, 64);
    let pass = t.render_pass("clear", &[TextureFormat::Rgba8Unorm], Some(TextureFormat::Depth32Float), 16, 16);
    let color = t.render_target("color", 16, 16, TextureFormat::Rgba8Unorm);
    let depth = t.render_target("depth", 16, 16, TextureFormat::Depth32Float);
    let framebuffer = t
        .ctx
        .create_framebuffer(&FramebufferDesc {
            label: None,
            pass,
            color_targets: vec![color],
            depth_target: Some(depth),
        })
        .unwrap();
    let clears = [ClearValue::OPAQUE_BLACK, ClearValue::DEPTH_ONE];

    t.ctx.begin_frame().unwrap();
    assert!(t.ctx.begin_render_pass(pass, framebuffer, &clears[..1]).is_err());
    t.ctx.begin_render_pass(pass, framebuffer, &clears).unwrap();
    t.ctx.end_render_pass().unwrap();
    t.ctx.end_frame().unwrap();

    let forwarded = t.headless().commands().iter().find_map(|c| match c {
        RecordedCommand::BeginRenderPass { clear_values, .. } => Some(clear_values.clone()),
        _ => None,
    });
    assert_eq!(forwarded, Some(clears.to_vec()));
}

// ============================================================================
// Resource tables
// ============================================================================

#[test]
fn resource_table_slots_never_overlap() {
    let mut t = TestContext::new(64, 64);
    let constants = t.ctx.create_buffer(1, 64, BufferUsage::UNIFORM, "constants").unwrap();
    let storage = t.ctx.create_buffer(16, 16, BufferUsage::STORAGE, "storage").unwrap();
    let sampler = t.ctx.create_sampler(&SamplerDesc::linear_wrap()).unwrap();
    let a = t.render_target("a", 8, 8, TextureFormat::Rgba8Unorm);
    let b = t.render_target("b", 8, 8, TextureFormat::Rgba8Unorm);

    let mut ranges = Vec::new();
    for _ in 0..3 {
        let table = t.ctx.create_resource_table().unwrap();
        t.ctx.set_constant_buffers(table, &[constants, constants]).unwrap();
        t.ctx.set_textures(table, &[a, b], &[sampler, sampler]).unwrap();
        t.ctx.set_buffers(table, &[storage]).unwrap();
        let desc = t.ctx.resource_table_desc(table).unwrap();
        ranges.extend(desc.constant_buffer_range);
        ranges.extend(desc.texture_range);
        ranges.extend(desc.buffer_range);
    }
    assert_eq!(ranges.len(), 9);
    assert_eq!(t.ctx.allocated_descriptor_slots(), 15);
    for (i, first) in ranges.iter().enumerate() {
        for second in &ranges[i + 1..] {
            assert!(!first.overlaps(second), "{first:?} overlaps {second:?}");
        }
    }
}

#[test]
fn resource_table_categories_must_be_set_in_order() {
    let mut t = TestContext::new(64, 64);
    let constants = t.ctx.create_buffer(1, 64, BufferUsage::UNIFORM, "constants").unwrap();
    let storage = t.ctx.create_buffer(4, 16, BufferUsage::STORAGE, "storage").unwrap();
    let table = t.ctx.create_resource_table().unwrap();

    t.ctx.set_buffers(table, &[storage]).unwrap();
    assert!(matches!(
        t.ctx.set_constant_buffers(table, &[constants]),
        Err(RenderError::InvalidBindingOrder(_))
    ));
}

#[test]
fn destroyed_tables_return_their_slots() {
    let mut t = TestContext::new(64, 64);
    let constants = t.ctx.create_buffer(1, 64, BufferUsage::UNIFORM, "constants").unwrap();
    let table = t.ctx.create_resource_table().unwrap();
    t.ctx.set_constant_buffers(table, &[constants; 4]).unwrap();
    assert_eq!(t.ctx.allocated_descriptor_slots(), 4);

    t.ctx.destroy_resource_table(table);
    assert_eq!(t.ctx.allocated_descriptor_slots(), 0);
    assert_eq!(t.headless().live_resource_tables(), 0);
}

// ============================================================================
// Textures
// ============================================================================

#[rstest]
#[case::missing("does_not_exist.png")]
#[case::absolute_missing("/definitely/not/here.png")]
fn missing_texture_creates_no_resource(#[case] name: &str) {
    let mut t = TestContext::new(64, 64);
    let before = t.ctx.texture_count();
    let result = TextureLoader::load(&mut t.ctx, name);
    assert!(matches!(result, Err(RenderError::AssetNotFound(_))));
    assert_eq!(t.ctx.texture_count(), before);
    assert_eq!(t.headless().live_textures(), before);
}

#[test]
fn resize_changes_the_surface_size() {
    let mut t = TestContext::new(64, 64);
    t.ctx.resize(200, 100);
    assert_eq!(t.ctx.surface_size(), (200, 100));

    let info = t.ctx.begin_frame().unwrap();
    assert_eq!((info.width, info.height), (200, 100));
    t.ctx.end_frame().unwrap();
}

// ============================================================================
// Backends
// ============================================================================

#[rstest]
#[case::dx12(BackendType::Dx12)]
#[case::opengl(BackendType::OpenGl)]
#[case::vulkan(BackendType::Vulkan)]
#[case::headless(BackendType::Headless)]
fn uniform_buffers_are_padded_per_backend(#[case] backend: BackendType) {
    let Some(mut t) = TestContext::for_backend(backend, 64, 64) else {
        assert_ne!(backend, BackendType::Headless, "headless must always run");
        return;
    };
    let buffer = t.ctx.create_buffer(1, 20, BufferUsage::UNIFORM, "constants").unwrap();
    let expected = if backend == BackendType::OpenGl { 32 } else { 256 };
    assert_eq!(t.ctx.buffer_size(buffer), Some(expected));
    assert_eq!(t.ctx.read_buffer(buffer).unwrap().len(), 20);
}
