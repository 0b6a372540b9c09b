//! # Deferred Demo
//!
//! A lit scene rendered through the full pass chain: a floor and a few
//! spinning cubes, the sun casting shadows, two sphere lights and debug
//! lines. A small script bobs one of the lights up and down.
//!
//! ```text
//! cargo run --example deferred -- --backend vulkan
//! cargo run --example deferred -- --backend headless --frames 60
//! ```

use std::path::PathBuf;

use clap::Parser;
use glam::{Vec3, Vec4};
use prism_render::resources::{GBufferMaterialDesc, ModelData, ParallaxMaterialDesc, UnlitMaterialDesc};
use prism_render::scene::{
    Atmosphere, AtmosphereEntity, DebugShapeEntity, MeshEntity, SphereLight, SphereLightEntity, Sun, SunEntity,
    Transform,
};
use prism_render::scripting::{FnScriptHost, ScriptCapabilities};
use prism_render::{window, BackendType, EngineConfig, EngineContext, RenderResult};

/// Backend names accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Direct3D 12 through wgpu
    Dx12,
    /// OpenGL through wgpu
    #[value(name = "opengl")]
    OpenGl,
    /// Vulkan through ash
    #[default]
    Vulkan,
    /// No window; renders on the CPU recording backend
    Headless,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Dx12 => BackendType::Dx12,
            CliBackend::OpenGl => BackendType::OpenGl,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Headless => BackendType::Headless,
        }
    }
}

/// Prism deferred rendering demo
#[derive(Parser, Debug)]
#[command(name = "deferred", version)]
struct Args {
    /// Graphics backend to use.
    #[arg(long, default_value = "vulkan", value_enum)]
    backend: CliBackend,

    /// Initial window width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial window height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Disable vertical sync.
    #[arg(long)]
    no_vsync: bool,

    /// Frames to render with the headless backend.
    #[arg(long, default_value = "120")]
    frames: u64,

    /// Asset root containing data/shaders.
    #[arg(long)]
    root: Option<PathBuf>,
}

fn setup_scene(engine: &mut EngineContext) -> RenderResult<()> {
    log::info!("Setting up scene...");

    let floor_material = engine.create_material(
        &GBufferMaterialDesc::new("floor")
            .with_tint(Vec4::new(0.55, 0.55, 0.6, 1.0))
            .with_roughness(0.9),
    )?;
    let metal_material = engine.create_material(
        &GBufferMaterialDesc::new("metal")
            .with_tint(Vec4::new(0.95, 0.64, 0.54, 1.0))
            .with_roughness(0.3)
            .with_metallic(1.0),
    )?;
    let plastic_material = engine.create_material(
        &GBufferMaterialDesc::new("plastic")
            .with_tint(Vec4::new(0.2, 0.4, 0.9, 1.0))
            .with_roughness(0.5),
    )?;

    let relief_material = engine.create_parallax_material(
        &ParallaxMaterialDesc::new("relief").with_height_scale(0.06),
    )?;
    let beacon_material = engine.create_unlit_material(&UnlitMaterialDesc::constant_color(
        "beacon",
        Vec4::new(1.0, 0.85, 0.3, 1.0),
    ))?;

    let plane = engine.create_geometry(&ModelData::plane(20.0, 20.0, 4))?;
    let panel = engine.create_geometry(&ModelData::plane(2.0, 2.0, 1))?;
    let cube = engine.create_geometry(&ModelData::cube())?;
    let sphere = engine.create_geometry(&ModelData::sphere(32, 16))?;

    engine.spawn(MeshEntity::new("floor", plane, Transform::new()).with_material(floor_material));
    for (i, x) in [-3.0f32, 0.0, 3.0].into_iter().enumerate() {
        let material = if i % 2 == 0 {
            metal_material.clone()
        } else {
            plastic_material.clone()
        };
        engine.spawn(
            MeshEntity::new(
                format!("cube_{i}"),
                cube.clone(),
                Transform::from_position(Vec3::new(x, 0.5, 0.0)),
            )
            .with_material(material)
            .with_spin(Vec3::Y, 0.4 + i as f32 * 0.3),
        );
    }
    engine.spawn(
        MeshEntity::new(
            "ball",
            sphere,
            Transform::from_position_scale(Vec3::new(0.0, 1.5, -3.0), Vec3::splat(1.5)),
        )
        .with_material(plastic_material),
    );

    engine.spawn(
        MeshEntity::new(
            "relief",
            panel.clone(),
            Transform::from_position(Vec3::new(-3.0, 0.01, 3.0)),
        )
        .with_material(relief_material),
    );
    engine.spawn(
        MeshEntity::new(
            "beacon",
            panel,
            Transform::from_position(Vec3::new(3.0, 0.01, 3.0)),
        )
        .with_material(beacon_material),
    );

    let sun = SunEntity::new("sun", Sun::new(0.6, 0.8));
    sun.set_power(2.5);
    engine.spawn(sun);
    engine.spawn(SphereLightEntity::new(
        "lamp",
        SphereLight::new(Vec3::new(-2.0, 1.5, 2.0), Vec3::new(1.0, 0.5, 0.2), 20.0),
    ));
    engine.spawn(SphereLightEntity::new(
        "fill",
        SphereLight::new(Vec3::new(3.0, 2.5, -1.0), Vec3::new(0.3, 0.5, 1.0), 12.0),
    ));

    engine.spawn(AtmosphereEntity::new("sky", Atmosphere::default()));

    engine.spawn(DebugShapeEntity::grid("grid", 20, 1.0, Vec3::splat(0.35)));
    engine.spawn(DebugShapeEntity::axes("axes").with_transform(Transform::from_position(Vec3::new(0.0, 0.01, 0.0))));
    engine.spawn(
        DebugShapeEntity::wire_cube("bounds", 1.1, Vec3::new(1.0, 1.0, 0.0))
            .with_transform(Transform::from_position(Vec3::new(3.0, 0.5, 0.0))),
    );

    let mut time = 0.0f32;
    engine.set_script_host(Box::new(FnScriptHost::new(
        move |caps: &dyn ScriptCapabilities, dt: f32| {
            time += dt;
            if let Some(lamp) = caps.find_entity("lamp") {
                caps.translate_entity(lamp, Vec3::Y * (time * 2.0).cos() * dt);
            }
        },
    )));

    log::info!("Scene ready: {} entities", engine.world().len());
    Ok(())
}

fn run_headless(config: EngineConfig, frames: u64) -> RenderResult<()> {
    let mut engine = EngineContext::new_headless(config)?;
    setup_scene(&mut engine)?;
    for _ in 0..frames {
        engine.tick(1.0 / 60.0)?;
    }
    log::info!(
        "Rendered {} frames; last frame had {} static draws",
        engine.frame_index(),
        engine.frame().static_draws.len()
    );
    engine.shutdown();
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = EngineConfig::default()
        .with_title("Prism - Deferred Demo")
        .with_size(args.width, args.height)
        .with_backend(args.backend.into())
        .with_vsync(!args.no_vsync);
    if let Some(root) = args.root {
        config = config.with_root_path(root);
    }

    let result = if args.backend == CliBackend::Headless {
        run_headless(config, args.frames)
    } else {
        window::run(config, setup_scene)
    };
    if let Err(e) = result {
        log::error!("Demo failed: {e}");
        std::process::exit(1);
    }
}
