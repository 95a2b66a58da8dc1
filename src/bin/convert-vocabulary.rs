use abow_vocab::{
    cli, peek_kind, BowErr, BowResult, Descriptor, DescriptorKind, OrbDesc, SiftDesc, Vocabulary,
};
use clap::{ArgAction, Parser};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

/// Convert a binary vocabulary to text, or a text vocabulary back to binary.
///
/// By default the result is written next to the input with the other
/// extension (`.voc` <-> `.txt`).
#[derive(Parser)]
#[command(name = "convert-vocabulary", version)]
struct Args {
    /// Vocabulary to convert
    path: PathBuf,

    /// Destination file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Descriptor family; required when converting from text
    #[arg(short, long)]
    descriptor: Option<DescriptorKind>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let args = Args::parse();
    cli::init_logging(args.verbose);
    cli::finish(run(&args))
}

fn run(args: &Args) -> BowResult<()> {
    let from_text = cli::is_text(&args.path);
    let output = args
        .output
        .clone()
        .unwrap_or_else(|| cli::twin_path(&args.path));
    let kind = match args.descriptor {
        Some(kind) => kind,
        None if from_text => {
            return Err(BowErr::InvalidConfig(
                "converting from text needs --descriptor".to_string(),
            ))
        }
        None => peek_kind(&args.path)?,
    };
    match kind {
        DescriptorKind::Orb => convert::<OrbDesc>(&args.path, &output, from_text)?,
        DescriptorKind::Sift => convert::<SiftDesc>(&args.path, &output, from_text)?,
    }
    println!("Wrote {}", output.display());
    Ok(())
}

fn convert<D: Descriptor>(input: &Path, output: &Path, from_text: bool) -> BowResult<()> {
    if from_text {
        Vocabulary::<D>::load_txt(input)?.save(output)
    } else {
        Vocabulary::<D>::load(input)?.save_txt(output)
    }
}
