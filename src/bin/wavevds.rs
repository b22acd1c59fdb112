//! WaveVDS command line tool
//!
//! Create datasets, inspect them, and move raw little-endian `f32` volumes
//! in and out of them.
//!
//! # Usage
//!
//! ```bash
//! wavevds create ./run1 --dims 200x200x200 --block 64x64x64 --cratios 1,10,100,500 --var temp:3D
//! wavevds import ./run1 --var temp --timestep 0 temp.raw
//! wavevds export ./run1 --var temp --timestep 0 --lod 1 --reflevel 2 temp_coarse.raw
//! wavevds info ./run1
//! ```

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use wavevds::utils::{f32_from_le_bytes, f32_to_le_bytes, format_bytes, parse_triple};
use wavevds::{
    BlockStore, BoundaryMode, DatasetMetadata, StoreConfig, VarType, VariableDescriptor, WaveletFamily,
};

/// Wavelet-compressed volume data store tool
#[derive(Parser, Debug)]
#[command(name = "wavevds", version)]
#[command(about = "Create, inspect, import and export wavelet-compressed volume datasets")]
struct Args {
    /// Worker threads for block transforms (defaults to WAVEVDS_THREADS or CPU count)
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty dataset
    Create {
        /// Dataset root directory
        root: PathBuf,

        /// Volume extents, NXxNYxNZ
        #[arg(long)]
        dims: String,

        /// Block extents, BXxBYxBZ
        #[arg(long, default_value = "64x64x64")]
        block: String,

        /// Wavelet family (haar, bior2.2, bior3.3, bior4.4)
        #[arg(long, default_value = "bior3.3")]
        wavelet: String,

        /// Boundary extension (symh, symw, per, sp0)
        #[arg(long, default_value = "symh")]
        boundary: String,

        /// Compression ratios, one per LOD
        #[arg(long, value_delimiter = ',', default_value = "1")]
        cratios: Vec<usize>,

        /// Number of timesteps
        #[arg(long, default_value = "1")]
        timesteps: usize,

        /// Variable as NAME:TYPE[:MISSING], TYPE one of 3D, 2DXY, 2DXZ, 2DYZ
        #[arg(long = "var", required = true)]
        vars: Vec<String>,
    },

    /// Print the dataset description and per-variable state
    Info {
        /// Dataset root directory
        root: PathBuf,
    },

    /// Write a raw f32 volume into a variable instance
    Import {
        /// Dataset root directory
        root: PathBuf,

        #[arg(long)]
        var: String,

        #[arg(long, default_value = "0")]
        timestep: usize,

        /// Raw little-endian f32 input, x fastest
        input: PathBuf,
    },

    /// Read a variable instance into a raw f32 file
    Export {
        /// Dataset root directory
        root: PathBuf,

        #[arg(long)]
        var: String,

        #[arg(long, default_value = "0")]
        timestep: usize,

        /// Refinement level (defaults to native resolution)
        #[arg(long)]
        reflevel: Option<usize>,

        /// Level of detail (defaults to the finest)
        #[arg(long)]
        lod: Option<usize>,

        /// Raw little-endian f32 output, x fastest
        output: PathBuf,
    },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config = StoreConfig::from_env();
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }

    match args.command {
        Command::Create {
            root,
            dims,
            block,
            wavelet,
            boundary,
            cratios,
            timesteps,
            vars,
        } => {
            let wavelet =
                WaveletFamily::from_name(&wavelet).ok_or_else(|| anyhow!("unknown wavelet {}", wavelet))?;
            let boundary = BoundaryMode::from_name(&boundary)
                .ok_or_else(|| anyhow!("unknown boundary mode {}", boundary))?;
            let mut metadata = DatasetMetadata::new(parse_triple(&dims)?, parse_triple(&block)?)
                .with_wavelet(wavelet, boundary)
                .with_cratios(cratios)
                .with_timesteps(timesteps);
            for var in &vars {
                metadata.add_variable(parse_variable(var)?)?;
            }
            let store = BlockStore::create(&root, metadata, config)
                .with_context(|| format!("creating dataset at {}", root.display()))?;
            info!("Created dataset: {}", store.metadata().summary());
        }
        Command::Info { root } => print_info(&root, config)?,
        Command::Import {
            root,
            var,
            timestep,
            input,
        } => import(&root, config, &var, timestep, &input)?,
        Command::Export {
            root,
            var,
            timestep,
            reflevel,
            lod,
            output,
        } => export(&root, config, &var, timestep, reflevel, lod, &output)?,
    }
    Ok(())
}

fn parse_variable(text: &str) -> Result<VariableDescriptor> {
    let mut parts = text.split(':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(|| anyhow!("empty variable name"))?;
    let var_type = match parts.next() {
        Some(t) => VarType::from_name(t).ok_or_else(|| anyhow!("unknown variable type {}", t))?,
        None => VarType::Var3D,
    };
    let mut desc = VariableDescriptor::new(name, var_type);
    if let Some(missing) = parts.next() {
        let value: f32 = missing
            .parse()
            .with_context(|| format!("missing value of {}", name))?;
        desc = desc.with_missing_value(value);
    }
    if parts.next().is_some() {
        bail!("expected NAME:TYPE[:MISSING], got {}", text);
    }
    Ok(desc)
}

fn print_info(root: &Path, config: StoreConfig) -> Result<()> {
    let store = BlockStore::open(root, config)?;
    let md = store.metadata();
    println!("Dataset: {}", root.display());
    println!("  {}", md.summary());
    println!("  Refinement levels: 0..={}", store.max_reflevel());
    println!("  Created: {}  Modified: {}", md.created_at, md.modified_at);
    for (key, value) in &md.custom_metadata {
        println!("  {} = {}", key, value);
    }

    for var in &md.variables {
        let compressor = store.compressor(&var.name)?;
        println!(
            "Variable {} ({}), ratios {:?}, {} transform levels",
            var.name,
            var.var_type,
            compressor.cratios(),
            compressor.num_levels()
        );
        for ts in 0..md.num_timesteps {
            let info = store.variable_info(&var.name, ts)?;
            if info.num_lods == 0 {
                continue;
            }
            let bytes: u64 = (0..info.num_lods)
                .filter_map(|lod| std::fs::metadata(wavevds::metadata::lod_file_path(root, &var.name, ts, lod)).ok())
                .map(|m| m.len())
                .sum();
            let range = info
                .data_range
                .map(|r| format!("[{}, {}]", r.min, r.max))
                .unwrap_or_else(|| "none".to_string());
            let valid = info
                .valid_region
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string());
            println!(
                "  t={:04} lods={} range={} valid={} size={}",
                ts,
                info.num_lods,
                range,
                valid,
                format_bytes(bytes as usize)
            );
        }
    }
    Ok(())
}

fn import(root: &Path, config: StoreConfig, var: &str, timestep: usize, input: &Path) -> Result<()> {
    let store = BlockStore::open(root, config)?;
    let dims = store.layout(var)?.dims();
    let plane = dims[0] * dims[1];

    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let expected = (plane * dims[2] * 4) as u64;
    let actual = file.metadata()?.len();
    if actual != expected {
        bail!(
            "{} holds {} bytes, {} x {} x {} f32 volume needs {}",
            input.display(),
            actual,
            dims[0],
            dims[1],
            dims[2],
            expected
        );
    }

    let mut reader = BufReader::new(file);
    let mut writer = store.open_writer(var, timestep)?;
    let mut buf = vec![0u8; plane * 4];
    for _ in 0..dims[2] {
        reader.read_exact(&mut buf)?;
        writer.write_slice(&f32_from_le_bytes(&buf)?)?;
    }
    let range = writer.data_range();
    writer.close()?;
    info!(var, timestep, ?range, "Imported {}", input.display());
    Ok(())
}

fn export(
    root: &Path,
    config: StoreConfig,
    var: &str,
    timestep: usize,
    reflevel: Option<usize>,
    lod: Option<usize>,
    output: &Path,
) -> Result<()> {
    let store = BlockStore::open(root, config)?;
    let reflevel = reflevel.unwrap_or(store.max_reflevel());
    let lod = lod.unwrap_or(store.num_lods() - 1);
    let mut reader = store.open_reader(var, timestep, reflevel, lod)?;
    let dims = reader.dims()?;

    let file = File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let mut out = BufWriter::new(file);
    while let Some(slice) = reader.read_slice()? {
        out.write_all(&f32_to_le_bytes(&slice))?;
    }
    out.flush()?;
    info!(
        var,
        timestep,
        reflevel,
        lod,
        "Exported {} x {} x {} voxels to {}",
        dims[0],
        dims[1],
        dims[2],
        output.display()
    );
    Ok(())
}
