//! rave-cache - inspect the caches of a RAVE run
//!
//! Prints the grid geometry derived from a run configuration and whether the
//! prepared-controls and inversion caches for that run are empty, complete or
//! inconsistent.

use anyhow::{Context, Result};
use candle_core::Device;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use candle_rave::cache::{self, CacheStatus};
use candle_rave::{CacheLayout, FsTensorStore, RaveError, RunConfig, TensorStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect the control and inversion caches of a RAVE run")]
struct Args {
    /// Run configuration (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Root directory holding `controls/` and `inverses/`
    #[arg(long, default_value = "cache")]
    cache_root: PathBuf,

    /// Decode every cached tensor instead of only listing keys
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_rave=info".parse()?)
                .add_directive("rave_cache=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = RunConfig::load(&args.config)
        .with_context(|| format!("loading run config {}", args.config.display()))?;

    let dims = config.grid_dims();
    info!(
        "Grid: {}x{} ({} frames per grid), {} grids, {} frames total",
        dims.rows,
        dims.cols,
        config.grid_frame_number(),
        config.sample_size,
        config.total_frame_number()
    );
    info!(
        "Steps: {} denoising, {} inversion (inversion {})",
        config.num_inference_steps,
        config.num_inversion_steps,
        if config.ddim_inversion { "on" } else { "off" }
    );
    info!(
        "ControlNets: {} with scales {:?}",
        config.num_controls(),
        config.controlnet_conditioning_scale.as_slice()
    );

    let layout = CacheLayout::for_run(&args.cache_root, &config);
    report(
        "controls",
        &layout.control_dir,
        &cache::control_keys(config.num_controls()),
        args.verify,
    )?;
    report(
        "inverses",
        &layout.inverse_dir,
        &cache::frame_keys(config.total_frame_number()),
        args.verify,
    )?;
    Ok(())
}

fn report(name: &str, dir: &Path, keys: &[String], verify: bool) -> Result<()> {
    if !dir.exists() {
        info!("{name}: {} (missing)", dir.display());
        return Ok(());
    }
    let store = FsTensorStore::open(dir)
        .with_context(|| format!("opening cache {}", dir.display()))?;
    match cache::cache_status(&store, keys) {
        Ok(CacheStatus::Empty) => info!("{name}: {} (empty)", dir.display()),
        Ok(CacheStatus::Complete) => {
            info!("{name}: {} (complete, {} entries)", store.dir().display(), keys.len());
            if verify {
                let tensors = cache::load_all(&store, keys, None, &Device::Cpu)
                    .with_context(|| format!("verifying {}", store.location()))?;
                for (key, t) in keys.iter().zip(&tensors) {
                    info!("  {key}: {:?}", t.dims());
                }
            }
        }
        Err(RaveError::CacheInconsistency { location, reason }) => {
            warn!("{name}: {location} is inconsistent: {reason}");
        }
        Err(e) => return Err(e).context(format!("reading cache {}", dir.display())),
    }
    Ok(())
}
