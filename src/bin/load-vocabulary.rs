use abow_vocab::{
    cli, peek_kind, BowErr, BowResult, Descriptor, DescriptorKind, OrbDesc, Report, SiftDesc,
    Vocabulary,
};
use clap::{ArgAction, Parser};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};

/// Load a vocabulary and print its summary.
#[derive(Parser)]
#[command(name = "load-vocabulary", version)]
struct Args {
    /// Binary vocabulary, or a text vocabulary when the extension is .txt
    path: PathBuf,

    /// Descriptor family; required for text vocabularies
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
    let text = cli::is_text(&args.path);
    let kind = match args.descriptor {
        Some(kind) => kind,
        None if text => {
            return Err(BowErr::InvalidConfig(
                "text vocabularies need --descriptor".to_string(),
            ))
        }
        None => peek_kind(&args.path)?,
    };
    let report = match kind {
        DescriptorKind::Orb => load::<OrbDesc>(&args.path, text)?,
        DescriptorKind::Sift => load::<SiftDesc>(&args.path, text)?,
    };
    println!("{}", report);
    Ok(())
}

fn load<D: Descriptor>(path: &Path, text: bool) -> BowResult<Report> {
    let voc = if text {
        Vocabulary::<D>::load_txt(path)?
    } else {
        Vocabulary::<D>::load(path)?
    };
    Ok(voc.report())
}
