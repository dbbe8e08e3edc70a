use std::error::Error;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use gvw::weaver::{weave, WeaveInput};
use gvw::WeaverError;
use thiserror::Error;

/// Command line interface for the check weaver.
#[derive(Parser, Debug)]
#[command(
    name = "gvw",
    about = "Weave residual verification checks into an IR program",
    author,
    version
)]
struct Cli {
    /// Path to the weave input (program + verifier output + residual
    /// checks) as JSON.
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Write the woven program to this file. Defaults to stdout.
    #[arg(short, long, value_name = "OUTPUT")]
    output: Option<PathBuf>,

    /// Emit a textual rendering instead of JSON.
    #[arg(long)]
    emit_text: bool,

    /// Report per-method collection results while weaving.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("failed to read input '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("weaving failed for '{path}'")]
    Weave {
        path: PathBuf,
        #[source]
        source: WeaverError,
    },
    #[error("failed to serialize woven program: {source}")]
    Export {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write output '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let Cli {
        input,
        output,
        emit_text,
        verbose,
    } = cli;

    let source = fs::read_to_string(&input).map_err(|source| CliError::ReadFile {
        path: input.clone(),
        source,
    })?;

    let mut bundle: WeaveInput =
        serde_json::from_str(&source).map_err(|source| CliError::Parse {
            path: input.clone(),
            source,
        })?;

    let collected = weave(&mut bundle.program, &bundle.verifier, &bundle.checks).map_err(
        |source| CliError::Weave {
            path: input.clone(),
            source,
        },
    )?;

    if verbose {
        for method in &collected.methods {
            eprintln!(
                "{}: style {}, {} condition term(s), {} runtime check(s)",
                method.name,
                method.call_style,
                method.conditions.len(),
                method.checks.len()
            );
        }
        if collected.requires_tracking() {
            eprintln!("ownership tracking enabled");
        }
    }

    let rendered = if emit_text {
        bundle.program.to_string()
    } else {
        serde_json::to_string_pretty(&bundle.program)
            .map_err(|source| CliError::Export { source })?
    };

    if let Some(out_path) = output {
        fs::write(&out_path, rendered).map_err(|source| CliError::WriteFile {
            path: out_path,
            source,
        })?;
    } else {
        println!("{}", rendered);
    }

    Ok(())
}

fn report_error(err: &CliError) {
    eprintln!("error: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }

    match err {
        CliError::Parse { .. } => {
            eprintln!("  hint: the input must be a JSON weave bundle (program, verifier, checks).");
        }
        CliError::Weave { .. } => {
            eprintln!(
                "  hint: a structural mismatch usually means the verifier output and the IR were produced from different sources."
            );
        }
        _ => {}
    }
}
