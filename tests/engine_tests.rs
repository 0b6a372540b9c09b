//! Engine integration tests.
//!
//! A small scene is ticked through the whole pass chain on the headless
//! backend; the recorded commands and simulated texture states are checked
//! afterwards.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use rstest::rstest;

use common::headless_engine;
use prism_render::backend::headless::RecordedCommand;
use prism_render::backend::{HeadlessBackend, TextureState};
use prism_render::pipeline::PassType;
use prism_render::resources::{
    DrawView, GBufferMaterialDesc, Material, ModelData, ParallaxMaterialDesc, UnlitMaterialDesc,
};
use prism_render::scene::{
    Atmosphere, AtmosphereEntity, DebugShapeEntity, MeshEntity, SphereLight, SphereLightEntity, Sun,
    SunEntity, Transform,
};
use prism_render::scripting::{FnScriptHost, ScriptCapabilities};
use prism_render::EngineContext;

fn headless(engine: &EngineContext) -> &HeadlessBackend {
    engine
        .context()
        .backend_as::<HeadlessBackend>()
        .expect("headless backend")
}

/// Commands recorded since the most recent `BeginFrame`
fn last_frame(engine: &EngineContext) -> Vec<RecordedCommand> {
    let commands = headless(engine).commands();
    let start = commands
        .iter()
        .rposition(|c| matches!(c, RecordedCommand::BeginFrame(_)))
        .unwrap_or(0);
    commands[start..].to_vec()
}

fn last_frame_markers(engine: &EngineContext) -> Vec<String> {
    last_frame(engine)
        .into_iter()
        .filter_map(|c| match c {
            RecordedCommand::PushMarker(label) => Some(label),
            _ => None,
        })
        .collect()
}

fn marker_position(markers: &[String], label: &str) -> usize {
    markers
        .iter()
        .position(|m| m == label)
        .unwrap_or_else(|| panic!("{label} never ran: {markers:?}"))
}

fn populate(engine: &mut EngineContext) {
    let material = engine
        .create_material(&GBufferMaterialDesc::new("stone").with_tint(Vec4::new(0.5, 0.5, 0.5, 1.0)))
        .unwrap();
    let cube = engine.create_geometry(&ModelData::cube()).unwrap();
    let plane = engine.create_geometry(&ModelData::plane(10.0, 10.0, 2)).unwrap();

    engine.spawn(MeshEntity::new("floor", plane, Transform::new()).with_material(material.clone()));
    engine.spawn(
        MeshEntity::new("cube", cube.clone(), Transform::from_position(Vec3::new(0.0, 0.5, 0.0)))
            .with_material(material),
    );
    engine.spawn(MeshEntity::new("plain", cube, Transform::from_position(Vec3::new(2.0, 0.5, 0.0))));
    engine.spawn(SunEntity::new("sun", Sun::new(0.3, 0.9)));
    engine.spawn(SphereLightEntity::new(
        "lamp",
        SphereLight::new(Vec3::new(1.0, 2.0, 1.0), Vec3::ONE, 10.0),
    ));
    engine.spawn(AtmosphereEntity::new("sky", Atmosphere::default()));
    engine.spawn(DebugShapeEntity::axes("axes"));
    engine.spawn(DebugShapeEntity::wire_cube("hud", 20.0, Vec3::X).in_gui());
}

/// Adds one unlit, one constant color and one parallax mapped mesh
fn populate_special_materials(engine: &mut EngineContext) {
    let quad = engine.create_geometry(&ModelData::plane(1.0, 1.0, 1)).unwrap();
    let unlit = engine
        .create_unlit_material(&UnlitMaterialDesc::textured("screen", ""))
        .unwrap();
    let marker = engine
        .create_unlit_material(&UnlitMaterialDesc::constant_color(
            "marker",
            Vec4::new(1.0, 0.2, 0.1, 1.0),
        ))
        .unwrap();
    let bricks = engine
        .create_parallax_material(&ParallaxMaterialDesc::new("bricks").with_height_scale(0.08))
        .unwrap();
    engine.spawn(
        MeshEntity::new("screen", quad.clone(), Transform::from_position(Vec3::new(-2.0, 1.0, 0.0)))
            .with_material(unlit),
    );
    engine.spawn(
        MeshEntity::new("marker", quad.clone(), Transform::from_position(Vec3::new(-3.0, 1.0, 0.0)))
            .with_material(marker),
    );
    engine.spawn(
        MeshEntity::new("wall", quad, Transform::from_position(Vec3::new(0.0, 0.0, -2.0)))
            .with_material(bricks),
    );
}

#[test]
fn scene_frame_reaches_the_backbuffer() {
    let mut engine = headless_engine(160, 90);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();

    assert_eq!(engine.frame_index(), 1);
    assert_eq!(engine.frame().static_draws.len(), 3);
    assert_eq!(engine.frame().dynamic_draws.len(), 1);
    assert_eq!(engine.frame().gui_draws.len(), 1);
    assert_eq!(engine.frame().sphere_lights().len(), 1);
    assert!(engine.frame().sun().is_some());

    let backend = headless(&engine);
    assert!(backend.draws_into(engine.context().backbuffer()) > 0);
    assert_eq!(backend.state_mismatches(), 0);
    assert_eq!(backend.frame_count(), 1);
}

#[test]
fn intermediate_targets_end_the_frame_shader_readable() {
    let mut engine = headless_engine(128, 128);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();
    engine.tick(1.0 / 60.0).unwrap();

    let targets = engine.renderer().intermediate_targets();
    assert!(!targets.is_empty());
    for texture in targets {
        assert_eq!(
            engine.context().texture_state(texture),
            Some(TextureState::ShaderRead),
            "{:?}",
            engine.context().texture_desc(texture).map(|d| d.label.clone())
        );
        assert!(headless(&engine).draws_into(texture) > 0);
    }
    assert_eq!(headless(&engine).state_mismatches(), 0);
}

#[test]
fn passes_run_in_frame_order() {
    let mut engine = headless_engine(96, 64);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();

    let markers = last_frame_markers(&engine);
    let positions: Vec<usize> = PassType::ORDER
        .iter()
        .map(|pass| marker_position(&markers, pass.name()))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{markers:?}");

    let pushes = markers.len();
    let pops = last_frame(&engine)
        .iter()
        .filter(|c| matches!(c, RecordedCommand::PopMarker))
        .count();
    assert_eq!(pushes, pops);
}

#[test]
fn sky_is_drawn_between_lighting_and_bloom() {
    let mut engine = headless_engine(96, 64);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();
    assert!(engine.frame().atmosphere().is_some());

    let markers = last_frame_markers(&engine);
    let lighting = marker_position(&markers, PassType::DeferredLight.name());
    let atmosphere = marker_position(&markers, PassType::Atmosphere.name());
    let bloom = marker_position(&markers, PassType::Bloom.name());
    let stages = ["Atmosphere Transmittance", "Atmosphere Sky View", "Atmosphere Apply"]
        .map(|label| marker_position(&markers, label));
    assert!(lighting < atmosphere, "{markers:?}");
    assert!(atmosphere < stages[0], "{markers:?}");
    assert!(stages.windows(2).all(|w| w[0] < w[1]), "{markers:?}");
    assert!(stages[2] < bloom, "{markers:?}");

    let hdr = engine.renderer().lighting().hdr_output().expect("hdr target");
    assert!(headless(&engine).draws_into(hdr) >= 2);
    assert_eq!(headless(&engine).state_mismatches(), 0);
}

#[test]
fn scene_without_atmosphere_skips_the_sky() {
    let mut engine = headless_engine(64, 64);
    engine.spawn(SunEntity::new("sun", Sun::new(0.3, 0.9)));
    engine.tick(1.0 / 60.0).unwrap();
    assert!(engine.frame().atmosphere().is_none());

    let markers = last_frame_markers(&engine);
    marker_position(&markers, PassType::Atmosphere.name());
    assert!(
        !markers.iter().any(|m| m.starts_with("Atmosphere ")),
        "{markers:?}"
    );
}

#[test]
fn command_log_holds_only_recent_frames() {
    let mut engine = headless_engine(64, 64);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();
    engine.tick(1.0 / 60.0).unwrap();
    let settled = headless(&engine).commands().len();

    for _ in 0..100 {
        engine.tick(1.0 / 60.0).unwrap();
    }
    let commands = headless(&engine).commands();
    assert!(commands.len() <= settled, "{} > {settled}", commands.len());
    let frames = commands
        .iter()
        .filter(|c| matches!(c, RecordedCommand::BeginFrame(_)))
        .count();
    assert_eq!(frames, 2);

    engine
        .context_mut()
        .backend_as_mut::<HeadlessBackend>()
        .expect("headless backend")
        .clear_commands();
    assert!(headless(&engine).commands().is_empty());
    engine.tick(1.0 / 60.0).unwrap();
    assert!(matches!(
        headless(&engine).commands().first(),
        Some(RecordedCommand::BeginFrame(_))
    ));
}

#[test]
fn unlit_and_parallax_meshes_render() {
    let mut engine = headless_engine(96, 64);
    populate(&mut engine);
    populate_special_materials(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();

    assert_eq!(engine.frame().static_draws.len(), 6);
    let backend = headless(&engine);
    assert_eq!(backend.state_mismatches(), 0);
    assert!(backend.draws_into(engine.context().backbuffer()) > 0);
}

#[test]
fn special_materials_declare_their_passes() {
    let mut engine = headless_engine(64, 64);
    let unlit = engine
        .create_unlit_material(&UnlitMaterialDesc::constant_color("flat", Vec4::ONE))
        .unwrap();
    let parallax = engine
        .create_parallax_material(&ParallaxMaterialDesc::new("relief"))
        .unwrap();

    assert!(unlit.supports_pass(PassType::GBuffer));
    assert!(!unlit.supports_pass(PassType::Shadow));
    assert!(parallax.supports_pass(PassType::GBuffer));
    assert!(parallax.supports_pass(PassType::Shadow));
    assert_eq!(unlit.color(), Vec4::ONE);
    assert_eq!(parallax.params().height_scale, 0.05);

    // unlit surfaces do not cast shadows, so binding them records nothing
    let before = headless(&engine).commands().len();
    unlit
        .bind(
            engine.context_mut(),
            PassType::Shadow,
            &DrawView::new(Mat4::IDENTITY, Vec3::ZERO),
            &Mat4::IDENTITY,
        )
        .unwrap();
    assert_eq!(headless(&engine).commands().len(), before);
}

#[test]
fn missing_normal_map_fails_without_leaking() {
    let mut engine = headless_engine(64, 64);
    let textures = engine.context().texture_count();
    let result = engine.create_parallax_material(
        &ParallaxMaterialDesc::new("broken").with_normal_height("does_not_exist.png"),
    );
    assert!(result.is_err());
    assert_eq!(engine.context().texture_count(), textures);
}

#[test]
fn empty_scene_still_presents() {
    let mut engine = headless_engine(64, 64);
    engine.tick(0.016).unwrap();
    assert!(engine.frame().sun().is_none());
    assert!(headless(&engine).draws_into(engine.context().backbuffer()) > 0);
    assert!(last_frame(&engine)
        .iter()
        .any(|c| matches!(c, RecordedCommand::Present)));
}

#[rstest]
#[case::few(3)]
#[case::many(200)]
fn dynamic_draws_from_every_worker_are_kept(#[case] count: usize) {
    let mut engine = headless_engine(64, 64);
    for i in 0..count {
        engine.spawn(
            DebugShapeEntity::axes(format!("axes_{i}"))
                .with_transform(Transform::from_position(Vec3::new(i as f32, 0.0, 0.0))),
        );
    }
    for i in 0..count / 2 {
        engine.spawn(DebugShapeEntity::wire_cube(format!("gui_{i}"), 8.0, Vec3::Y).in_gui());
    }
    engine.tick(1.0 / 60.0).unwrap();

    assert_eq!(engine.frame().dynamic_draws.len(), count);
    assert_eq!(engine.frame().gui_draws.len(), count / 2);

    // draw lists are rebuilt, not appended to, on the next frame
    engine.tick(1.0 / 60.0).unwrap();
    assert_eq!(engine.frame().dynamic_draws.len(), count);
}

#[test]
fn binding_a_material_for_a_foreign_pass_records_nothing() {
    let mut engine = headless_engine(64, 64);
    let material = engine.create_material(&GBufferMaterialDesc::new("plain")).unwrap();
    let before = headless(&engine).commands().len();

    for pass in [PassType::Bloom, PassType::Tonemap, PassType::Present] {
        assert!(!material.supports_pass(pass));
        material
            .bind(
                engine.context_mut(),
                pass,
                &DrawView::new(Mat4::IDENTITY, Vec3::ZERO),
                &Mat4::IDENTITY,
            )
            .unwrap();
    }
    assert_eq!(headless(&engine).commands().len(), before);
    assert!(material.supports_pass(PassType::GBuffer));
    assert!(material.supports_pass(PassType::Shadow));
}

#[test]
fn materials_without_shadow_skip_the_shadow_pass() {
    let mut engine = headless_engine(64, 64);
    let material = engine
        .create_material(&GBufferMaterialDesc::new("glass").with_shadow(false))
        .unwrap();
    assert!(!material.supports_pass(PassType::Shadow));
    assert!(!material.casts_shadow());
}

#[test]
fn resize_rebuilds_size_dependent_targets() {
    let mut engine = headless_engine(64, 64);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();
    let shadow_map = engine.renderer().shadow().shadow_map();

    engine.resize(320, 200).unwrap();
    assert_eq!(engine.renderer().size(), (320, 200));
    assert_eq!(engine.context().surface_size(), (320, 200));
    for texture in engine.renderer().gbuffer().textures() {
        let desc = engine.context().texture_desc(texture).unwrap();
        assert_eq!((desc.width, desc.height), (320, 200));
    }
    // the shadow map does not follow the surface
    assert_eq!(engine.renderer().shadow().shadow_map(), shadow_map);

    engine.tick(1.0 / 60.0).unwrap();
    assert_eq!(headless(&engine).state_mismatches(), 0);
    assert!(headless(&engine).draws_into(engine.context().backbuffer()) > 0);
}

#[test]
fn zero_sized_resize_is_ignored() {
    let mut engine = headless_engine(64, 48);
    engine.resize(0, 100).unwrap();
    assert_eq!(engine.renderer().size(), (64, 48));
    engine.tick(1.0 / 60.0).unwrap();
}

#[test]
fn scripts_run_after_late_update() {
    let mut engine = headless_engine(64, 64);
    let start = Vec3::new(0.0, 1.0, 0.0);
    let lamp = engine.spawn(SphereLightEntity::new("lamp", SphereLight::new(start, Vec3::ONE, 5.0)));

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    engine.set_script_host(Box::new(FnScriptHost::new(
        move |caps: &dyn ScriptCapabilities, _dt: f32| {
            counter.fetch_add(1, Ordering::SeqCst);
            let id = caps.find_entity("lamp").expect("lamp exists");
            assert!(caps.translate_entity(id, Vec3::X));
            assert!(caps.find_entity("nobody").is_none());
        },
    )));

    engine.tick(1.0 / 60.0).unwrap();
    // the light was published before the script moved it
    assert_eq!(engine.frame().sphere_lights()[0].position, start);
    assert_eq!(engine.world().get(lamp).and_then(|e| e.position()), Some(start + Vec3::X));

    engine.tick(1.0 / 60.0).unwrap();
    assert_eq!(engine.frame().sphere_lights()[0].position, start + Vec3::X);
    assert_eq!(
        engine.world().get(lamp).and_then(|e| e.position()),
        Some(start + Vec3::X * 2.0)
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn spinning_meshes_move_between_frames() {
    let mut engine = headless_engine(64, 64);
    let cube = engine.create_geometry(&ModelData::cube()).unwrap();
    engine.spawn(MeshEntity::new("spinner", cube, Transform::new()).with_spin(Vec3::Y, 1.0));

    engine.tick(0.5).unwrap();
    let first = engine.frame().static_draws.lock()[0].transform;
    engine.tick(0.5).unwrap();
    let second = engine.frame().static_draws.lock()[0].transform;
    assert_ne!(first, second);
}

#[test]
fn shutdown_releases_every_resource() {
    let mut engine = headless_engine(64, 64);
    populate(&mut engine);
    engine.tick(1.0 / 60.0).unwrap();
    assert!(engine.context().texture_count() > 0);
    engine.shutdown();
}
