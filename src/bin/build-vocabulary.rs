use abow_vocab::{
    cli, extract::HostSiftDevice, vocabulary_path, BowResult, Descriptor, DescriptorKind,
    OrbExtractor, Pipeline, PipelineConfig, Report, ScoringType, SiftExtractor, Vocabulary,
    WeightingType,
};
use clap::{ArgAction, Parser};
use std::{path::PathBuf, process::ExitCode};

/// Build a visual vocabulary from every image under a directory.
///
/// The vocabulary is written to `<image_directory>/{orb|sift}_vocabulary.voc`.
#[derive(Parser)]
#[command(name = "build-vocabulary", version)]
struct Args {
    /// Directory scanned recursively for training images
    image_directory: PathBuf,

    /// Descriptor family to extract: orb (CPU, binary) or sift (floating)
    #[arg(short, long)]
    descriptor: Option<DescriptorKind>,

    /// Branching factor of the tree
    #[arg(short, long = "branching")]
    k: Option<usize>,

    /// Number of levels of the tree
    #[arg(short, long = "levels")]
    l: Option<usize>,

    /// tf-idf, tf, idf or binary
    #[arg(long)]
    weighting: Option<WeightingType>,

    /// l1, l2, chi-square, kl, bhattacharyya or dot-product
    #[arg(long)]
    scoring: Option<ScoringType>,

    /// TOML pipeline configuration; flags override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker threads for ORB extraction
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Fail when fewer descriptors than this are extracted
    #[arg(long)]
    min_descriptors: Option<usize>,

    /// Extract ORB descriptors with OpenCV
    #[cfg(feature = "opencv")]
    #[arg(long)]
    opencv: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Args {
    fn pipeline_config(&self) -> BowResult<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load_toml(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(descriptor) = self.descriptor {
            config.descriptor = descriptor;
        }
        let mut vocabulary = config.vocabulary_config();
        if let Some(k) = self.k {
            vocabulary.k = k;
        }
        if let Some(l) = self.l {
            vocabulary.l = l;
        }
        if let Some(weighting) = self.weighting {
            vocabulary.weighting = weighting;
        }
        if let Some(scoring) = self.scoring {
            vocabulary.scoring = scoring;
        }
        config.vocabulary = Some(vocabulary);
        if let Some(jobs) = self.jobs {
            config.jobs = jobs;
        }
        if let Some(min) = self.min_descriptors {
            config.min_descriptors = min;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.verbose);
    cli::finish(run(&args))
}

fn run(args: &Args) -> BowResult<()> {
    let config = args.pipeline_config()?;
    let root = &args.image_directory;
    let output = vocabulary_path(root, config.descriptor);

    let report = match config.descriptor {
        #[cfg(feature = "opencv")]
        DescriptorKind::Orb if args.opencv => {
            let extractor = abow_vocab::OpencvOrbExtractor::new(config.orb.max_features as i32)?;
            let voc = Pipeline::new(extractor, config)?.run(root, cli::print_progress)?;
            save(&voc, &output)?
        }
        DescriptorKind::Orb => {
            let extractor = OrbExtractor::new(config.orb.clone());
            let parallel = config.jobs > 1;
            let mut pipeline = Pipeline::new(extractor, config)?;
            let voc = if parallel {
                pipeline.run_parallel(root, cli::print_progress)?
            } else {
                pipeline.run(root, cli::print_progress)?
            };
            save(&voc, &output)?
        }
        DescriptorKind::Sift => {
            let extractor = SiftExtractor::new(HostSiftDevice::new(), config.sift.clone());
            let voc = Pipeline::new(extractor, config)?.run(root, cli::print_progress)?;
            save(&voc, &output)?
        }
    };

    println!("Saved vocabulary to {}", output.display());
    println!("{}", report);
    Ok(())
}

fn save<D: Descriptor>(voc: &Vocabulary<D>, output: &std::path::Path) -> BowResult<Report> {
    voc.save(output)?;
    Ok(voc.report())
}
