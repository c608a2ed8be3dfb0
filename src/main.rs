//! unitseg: scan a dataset with a classifier, build per-unit montages of the
//! top-activating images and tight-crop them.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use unitseg_rs::core::{
    config::VisualizerConfig,
    dataset::{read_image_list, Dataset},
    montage::visualize_layer,
    report::{write_class_index, write_layer_index},
    scanner::{extract_features, scan},
    tightcrop::{crop_directory, crop_montage_file},
};

#[derive(Parser)]
#[command(name = "unitseg")]
#[command(author, version)]
#[command(about = "Visualize which image regions activate the units of a classifier layer")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// JSON config; fields left out keep their defaults
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DatasetArgs {
    /// Image list, one path per line relative to --root
    #[arg(long, value_name = "FILE")]
    list: PathBuf,

    /// Directory the image list is resolved against
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Output directory
    #[arg(long, default_value = "result_segments")]
    out: PathBuf,

    /// Layers to process (defaults to the classifier's visualization layer)
    #[arg(long = "layer", value_name = "NAME")]
    layers: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record per-unit activations of every image and save them
    Scan {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Store global-average-pooled features instead of spatial maxima
        #[arg(long)]
        features: bool,
    },
    /// Scan, then build a montage of the top images for every unit
    Visualize {
        #[command(flatten)]
        dataset: DatasetArgs,

        /// Category list; enables the per-class unit index
        #[arg(long, value_name = "FILE")]
        labels: Option<PathBuf>,

        /// Units listed per class in the class index
        #[arg(long, default_value_t = 3)]
        top_units: usize,
    },
    /// Tight-crop the tiles of one montage
    Crop {
        input: PathBuf,
        output: PathBuf,

        /// Tile width in pixels (defaults to the montage height)
        #[arg(long)]
        tile_width: Option<u32>,

        /// Separator width between tiles (defaults to the configured margin)
        #[arg(long)]
        margin: Option<u32>,
    },
    /// Tight-crop every montage in a directory that has no cropped copy yet
    CropDir {
        dir: PathBuf,

        /// Separator width between tiles (defaults to the configured margin)
        #[arg(long)]
        margin: Option<u32>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(log_level))
        .init();

    let config = match &cli.config {
        Some(path) => VisualizerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => VisualizerConfig::default(),
    };

    match cli.command {
        Commands::Scan { dataset, features } => handle_scan(&config, dataset, features),
        Commands::Visualize {
            dataset,
            labels,
            top_units,
        } => handle_visualize(&config, dataset, labels.as_deref(), top_units),
        Commands::Crop {
            input,
            output,
            tile_width,
            margin,
        } => {
            let margin = margin.unwrap_or(config.margin);
            crop_montage_file(&input, &output, tile_width, margin, &config.crop)
                .with_context(|| format!("cropping {}", input.display()))?;
            println!("Saved {}", output.display());
            Ok(())
        }
        Commands::CropDir { dir, margin } => {
            let margin = margin.unwrap_or(config.margin);
            let written = crop_directory(&dir, margin, &config.crop)
                .with_context(|| format!("cropping montages in {}", dir.display()))?;
            println!("Cropped {written} montages");
            Ok(())
        }
    }
}

fn load_dataset(config: &VisualizerConfig, args: &DatasetArgs) -> Result<Dataset> {
    let paths = read_image_list(&args.list, &args.root)
        .with_context(|| format!("reading image list {}", args.list.display()))?;
    Ok(Dataset::new(paths, config.transform())?)
}

fn layers_or_default(config: &VisualizerConfig, args: &DatasetArgs) -> Vec<String> {
    if args.layers.is_empty() {
        vec![config.classifier.default_layer().to_string()]
    } else {
        args.layers.clone()
    }
}

fn handle_scan(config: &VisualizerConfig, args: DatasetArgs, features: bool) -> Result<()> {
    let dataset = load_dataset(config, &args)?;
    let mut classifier = config.classifier.build();
    let layers = layers_or_default(config, &args);
    let layer_refs: Vec<&str> = layers.iter().map(String::as_str).collect();

    let (matrices, report) = if features {
        extract_features(&dataset, classifier.as_mut(), &layer_refs, config.batch_size)?
    } else {
        scan(&dataset, classifier.as_mut(), &layer_refs, config.batch_size)?
    };

    let out_dir = args.out.join(classifier.name());
    std::fs::create_dir_all(&out_dir)?;

    for layer in &layers {
        let path = out_dir.join(format!("{layer}.bin"));
        matrices[layer.as_str()]
            .save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    println!("Scanned {} images in {} batches", report.images(), report.batch_sizes.len());

    Ok(())
}

fn handle_visualize(
    config: &VisualizerConfig,
    args: DatasetArgs,
    labels: Option<&Path>,
    top_units: usize,
) -> Result<()> {
    let dataset = load_dataset(config, &args)?;
    let mut classifier = config.classifier.build();
    let layers = layers_or_default(config, &args);
    let layer_refs: Vec<&str> = layers.iter().map(String::as_str).collect();

    let (matrices, report) = scan(&dataset, classifier.as_mut(), &layer_refs, config.batch_size)?;
    println!("Scanned {} images in {} batches", report.images(), report.batch_sizes.len());

    let out_dir = args.out.join(classifier.name());
    let image_dir = out_dir.join("image");
    std::fs::create_dir_all(&image_dir)?;

    for layer in &layers {
        let matrix = &matrices[layer.as_str()];
        matrix.save(&out_dir.join(format!("{layer}.bin")))?;

        let index = write_layer_index(&out_dir, layer, matrix.cols(), config.tight_crop)?;
        println!("Wrote {}", index.display());

        let written = visualize_layer(&dataset, classifier.as_mut(), matrix, config, &image_dir)
            .with_context(|| format!("visualizing layer {layer}"))?;
        println!("Saved {} images for layer {layer}", written.len());

        if let Some(labels) = labels {
            let index = write_class_index(
                &out_dir,
                layer,
                labels,
                classifier.class_weights(),
                top_units,
                config.tight_crop,
            )?;
            println!("Wrote {}", index.display());
        }
    }

    Ok(())
}
