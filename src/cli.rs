use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing_subscriber::{fmt, EnvFilter};

use crate::{pipeline::Progress, BowResult};

/// Install the stderr log subscriber. `RUST_LOG` applies when no `-v` is given.
pub fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// `i of N` line for one extracted image.
pub fn print_progress(p: Progress<'_>) {
    println!(
        "{} of {}: {} ({} descriptors)",
        p.index + 1,
        p.total,
        p.path.display(),
        p.descriptors
    );
}

/// Map a tool's result to its exit status, reporting errors on stderr.
pub fn finish(result: BowResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Whether `path` names a text vocabulary.
pub fn is_text(path: &Path) -> bool {
    path.extension()
        .map_or(false, |ext| ext.eq_ignore_ascii_case("txt"))
}

/// The other representation of a vocabulary file: `.voc` <-> `.txt`.
pub fn twin_path(path: &Path) -> PathBuf {
    if is_text(path) {
        path.with_extension("voc")
    } else {
        path.with_extension("txt")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twins() {
        assert_eq!(
            twin_path(Path::new("a/orb_vocabulary.voc")),
            PathBuf::from("a/orb_vocabulary.txt")
        );
        assert_eq!(twin_path(Path::new("v.TXT")), PathBuf::from("v.voc"));
        assert!(!is_text(Path::new("v")));
    }
}
