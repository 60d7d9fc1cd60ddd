//! jpegexp-stream CLI - inspect JPEG 2000 images and plan region decodes.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};

use jpegexp_stream::{
    ContainerParser, DecodeParameters, DiscardHeuristic, ExpansionLimits, Info, Jp2Container,
    Priming, Region, StreamingSource,
};

/// Region-of-interest JPEG 2000 decoding over streaming sources
#[derive(Parser)]
#[command(name = "jpegexp-stream")]
#[command(version)]
#[command(about = "Inspect JPEG 2000 images and plan region decodes", long_about = None)]
#[command(after_help = "EXAMPLES:
    jpegexp-stream info -i image.jp2
    jpegexp-stream info -i image.j2k --extended
    jpegexp-stream plan -i image.jp2 -x 0 -y 0 -w 4096 -H 4096 --scaled-width 512 --scaled-height 512

Set RUST_LOG=debug to trace header parsing and source reads.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display image metadata and codestream information
    ///
    /// Reads only the container and codestream headers.
    #[command(visible_alias = "i")]
    Info {
        /// Input file path
        #[arg(short, long, help = "Path to the JP2 or J2K file to inspect")]
        input: PathBuf,

        /// Show per-component and coding style details
        #[arg(short, long)]
        extended: bool,
    },

    /// Show the discard level and expansion a region decode would use
    #[command(visible_alias = "p")]
    Plan {
        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        /// Region left edge in native pixels
        #[arg(short, long, default_value = "0")]
        x: u32,

        /// Region top edge in native pixels
        #[arg(short, long, default_value = "0")]
        y: u32,

        /// Region width; defaults to the image width
        #[arg(short, long)]
        width: Option<u32>,

        /// Region height; defaults to the image height
        #[arg(short = 'H', long)]
        height: Option<u32>,

        /// Target output width
        #[arg(long)]
        scaled_width: u32,

        /// Target output height
        #[arg(long)]
        scaled_height: u32,

        /// Discard level heuristic
        #[arg(long, default_value = "bit-length", value_enum)]
        heuristic: Heuristic,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Heuristic {
    /// Coarsest tier covering the target, from bit lengths
    BitLength,
    /// Repeated halving of a floating-point scale
    ScaleDoubling,
}

impl From<Heuristic> for DiscardHeuristic {
    fn from(value: Heuristic) -> Self {
        match value {
            Heuristic::BitLength => DiscardHeuristic::BitLength,
            Heuristic::ScaleDoubling => DiscardHeuristic::ScaleDoubling,
        }
    }
}

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { input, extended } => show_info(&input, extended),
        Commands::Plan {
            input,
            x,
            y,
            width,
            height,
            scaled_width,
            scaled_height,
            heuristic,
        } => show_plan(
            &input,
            (x, y, width, height),
            scaled_width,
            scaled_height,
            heuristic.into(),
        ),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Parses the headers of `path` through a streaming source over a tokio file.
fn read_headers(path: &Path) -> Result<(Jp2Container, u64), Box<dyn std::error::Error>> {
    let file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    let source = StreamingSource::builder(jpegexp_stream::AsyncIoReader::new(
        tokio::fs::File::from_std(file),
    ))
    .priming(Priming::Eager(16 * 1024))
    .name(path.display().to_string())
    .build()?;

    let mut container = Jp2Container::new();
    if !container.open(&source)? {
        return Err("not a JP2 file or J2K codestream".into());
    }
    if !container.read_header(&source)? {
        return Err("no codestream found".into());
    }
    Ok((container, size))
}

fn show_info(input: &Path, extended: bool) -> Result<(), Box<dyn std::error::Error>> {
    let (container, size) = read_headers(input)?;
    let (Some(codestream), Some(channels)) =
        (container.access_codestream(0), container.channel_mapping(0))
    else {
        return Err("no codestream found".into());
    };
    let info = Info::from_codestream(codestream, channels)?;

    println!("File: {:?}", input);
    println!("Size: {} bytes", size);
    println!();
    println!(
        "Format: {}",
        if codestream.data_offset == 0 {
            "JPEG 2000 Codestream"
        } else {
            "JP2 Container (JPEG 2000)"
        }
    );
    println!("  Dimensions: {}x{}", info.width, info.height);
    println!("  Components: {}", codestream.components.len());
    println!("  Colour:     {:?}", channels.colour_space);
    println!("  Tile size:  {}x{}", info.tile_width, info.tile_height);
    println!(
        "  Tiles:      {}x{}",
        codestream.tiles_across(),
        codestream.tiles_down()
    );
    println!("  DWT levels: {}", info.dwt_levels);
    if let Some(cod) = &codestream.cod {
        println!("  Layers:     {}", cod.number_of_layers);
        println!("  Progression: {}", cod.progression_name());
    }
    println!(
        "  HTJ2K:      {}",
        if codestream.is_htj2k() { "Yes" } else { "No" }
    );

    if extended {
        println!("  Codestream: offset {}", codestream.data_offset);
        if let Some(length) = codestream.data_length {
            println!("  Length:     {} bytes", length);
        }
        for (index, component) in codestream.components.iter().enumerate() {
            println!(
                "  Component {}: {} bits{}, subsampling {}x{}",
                index,
                component.depth,
                if component.is_signed { " signed" } else { "" },
                component.dx,
                component.dy
            );
        }
        if let Some(cod) = &codestream.cod {
            println!(
                "  Code-blocks: {}x{}",
                1u32 << (cod.codeblock_width_exp + 2),
                1u32 << (cod.codeblock_height_exp + 2)
            );
            println!(
                "  Wavelet:    {}",
                if cod.transformation == 1 {
                    "5-3 reversible"
                } else {
                    "9-7 irreversible"
                }
            );
        }
        if codestream.roi.is_some() {
            println!("  ROI:        Present");
        }
    }

    Ok(())
}

fn show_plan(
    input: &Path,
    (x, y, width, height): (u32, u32, Option<u32>, Option<u32>),
    scaled_width: u32,
    scaled_height: u32,
    heuristic: DiscardHeuristic,
) -> Result<(), Box<dyn std::error::Error>> {
    let (container, _) = read_headers(input)?;
    let (Some(codestream), Some(channels)) =
        (container.access_codestream(0), container.channel_mapping(0))
    else {
        return Err("no codestream found".into());
    };
    let info = Info::from_codestream(codestream, channels)?;

    let requested = Region::new(
        x,
        y,
        width.unwrap_or(info.width),
        height.unwrap_or(info.height),
    );
    let region = requested.intersect(&info.bounds());
    if region.is_empty() {
        return Err(format!("region {:?} lies outside the {}x{} image", requested, info.width, info.height).into());
    }

    let params = DecodeParameters::derive(
        region,
        scaled_width,
        scaled_height,
        info.dwt_levels,
        heuristic,
        ExpansionLimits::default(),
    );

    println!(
        "Region:        {}x{} at ({}, {})",
        region.width, region.height, region.x, region.y
    );
    println!("Target:        {}x{}", scaled_width, scaled_height);
    println!(
        "Discard level: {} of {}",
        params.discard_level, info.dwt_levels
    );
    println!(
        "Render dims:   {}x{} at ({}, {})",
        params.render_dims.width,
        params.render_dims.height,
        params.render_dims.x,
        params.render_dims.y
    );
    println!(
        "Expansion:     {}/{} x {}/{}",
        params.expand_numerator.x,
        params.expand_denominator.x,
        params.expand_numerator.y,
        params.expand_denominator.y
    );
    println!(
        "Output size:   {}x{}",
        params.output_size.x, params.output_size.y
    );
    Ok(())
}
