//! Table tracker daemon and bench tools.
//!
//! ```bash
//! table_tracker run                   # control plane on the simulated camera
//! table_tracker exposure              # converge exposure once and print it
//! table_tracker locate 640 360        # map a pixel through the stored calibration
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use table_tracker::app::TrackerApp;
use table_tracker::calibration::Calibration;
use table_tracker::camera::CameraSlot;
use table_tracker::config::{Settings, DEFAULT_CONFIG_PATH};
use table_tracker::exposure::{ExposureController, ExposureOutcome};
use table_tracker::frames::{spawn_capture, FrameHub};
use table_tracker::geometry::PixelPoint;
use table_tracker::hardware::sim::{SimCamera, SimScene, SimVision};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Control plane for the table tracking camera.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the device control plane (default).
    Run,
    /// Converge the camera exposure once and print it.
    Exposure,
    /// Map an image pixel to table coordinates.
    Locate {
        /// Pixel column.
        x: i32,
        /// Pixel row.
        y: i32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
        settings.validate()?;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.application.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(settings).await,
        Command::Exposure => exposure(settings).await,
        Command::Locate { x, y } => locate(&settings, PixelPoint::new(x, y)),
    }
}

fn sim_hardware(settings: &Settings) -> (CameraSlot, Arc<SimVision>) {
    let scene = SimScene::demo(settings.camera.width, settings.camera.height);
    let camera = SimCamera::with_frame_interval(scene.clone(), settings.camera.frame_interval);
    (
        CameraSlot::new(Arc::new(camera)),
        Arc::new(SimVision::new(scene)),
    )
}

async fn run(settings: Settings) -> Result<()> {
    let (slot, vision) = sim_hardware(&settings);
    let mut app = TrackerApp::start(settings, &slot, vision).await?;
    let addr = app.serve_tcp().await?;
    tracing::info!(%addr, "Waiting for a peer");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    app.shutdown().await;
    Ok(())
}

async fn exposure(settings: Settings) -> Result<()> {
    let (slot, vision) = sim_hardware(&settings);
    let camera = slot.open("exposure")?;
    camera.start().await?;

    let frames = FrameHub::new();
    let cancel = CancellationToken::new();
    let capture = spawn_capture(camera.clone(), frames.clone(), cancel.clone());

    let (width, height) = camera.resolution();
    let controller = ExposureController::new(
        settings.exposure.clone(),
        settings.exposure.target_for(width, height),
    );
    tracing::info!(target = controller.target(), "Converging exposure");

    let stop = cancel.child_token();
    let interrupt = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let outcome = controller.run(&**camera, vision.as_ref(), &frames, &stop).await;
    cancel.cancel();
    capture.await?;

    match outcome {
        ExposureOutcome::Converged(us) => {
            println!("{us}");
            Ok(())
        }
        ExposureOutcome::Cancelled => anyhow::bail!("Exposure calibration interrupted"),
    }
}

fn locate(settings: &Settings, pixel: PixelPoint) -> Result<()> {
    let calibration = Calibration::load(&settings.calibration.path)
        .with_context(|| format!("No calibration at {}", settings.calibration.path.display()))?;
    let point = calibration.pixel_to_table(pixel);
    println!("{:.4} {:.4} {:.4}", point.x, point.y, point.z);
    Ok(())
}
