use clap::builder::styling;
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::ffi::OsString;
use std::path::PathBuf;

use attest_common::config::{ArtifactDir, EncodeOptions, TargetLocation, VerifyMode};

#[derive(Debug)]
pub struct Config {
    pub src_path: PathBuf,
    pub entrypoint: String,
    pub options: EncodeOptions,
    pub output_path: PathBuf,
    pub api_module_path: Option<PathBuf>,
    pub artifact_dir: Option<ArtifactDir>,
}

/// `FILE:LINE:POS`, split from the right so the file part may contain colons.
fn parse_target(text: &str) -> Option<TargetLocation> {
    let (rest, pos) = text.rsplit_once(':')?;
    let (file, line) = rest.rsplit_once(':')?;
    if file.is_empty() {
        return None;
    }
    Some(TargetLocation {
        file: file.to_owned(),
        line: line.parse().ok()?,
        pos: pos.parse().ok()?,
    })
}

fn encode_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("src-path")
                .help("The assembly file to encode.")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("entrypoint")
                .long("entrypoint")
                .short('e')
                .required(true)
                .help("Key of the invocation to verify."),
        )
        .arg(
            Arg::new("int-width")
                .long("int-width")
                .value_parser(1..=64i64)
                .default_value("16")
                .help("Bit width of the bounded integer encodings."),
        )
        .arg(
            Arg::new("large-ops")
                .long("large-ops")
                .action(ArgAction::SetTrue)
                .help(
                    "Encode map/filter/find/sum over symbolic-length collections with \
                    quantified axioms instead of treating them as unsupported faults.",
                ),
        )
        .arg(
            Arg::new("output-path")
                .short('o')
                .long("output-path")
                .help("Place the solver payload at this path."),
        )
        .arg(
            Arg::new("api-module")
                .long("api-module")
                .help("Also write the JSON API-module descriptor to this path."),
        )
        .arg(
            Arg::new("emit-artifacts")
                .long("emit-artifacts")
                .short('a')
                .action(ArgAction::SetTrue)
                .help(
                    "Emit encoding artifacts (payload, API module, fault table) into a \
                    directory named after the output file.",
                ),
        )
}

fn targeted_args(command: Command) -> Command {
    encode_args(command).arg(
        Arg::new("target")
            .long("target")
            .required(true)
            .value_parser(|s: &str| {
                parse_target(s).ok_or("expected FILE:LINE:POS".to_owned())
            })
            .help("Source position of the fault to analyze, as FILE:LINE:POS."),
    )
}

pub fn command() -> Command {
    let styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Cyan.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default());

    Command::new(std::env!("CARGO_PKG_NAME"))
        .version(std::env!("CARGO_PKG_VERSION"))
        .about(std::env!("CARGO_PKG_DESCRIPTION"))
        .styles(styles)
        .next_line_help(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(targeted_args(Command::new("check").about(
            "Emits a payload whose unsatisfiability proves the target fault unreachable",
        )))
        .subcommand(targeted_args(Command::new("witness").about(
            "Emits a payload whose model is an input that triggers the target fault",
        )))
        .subcommand(encode_args(Command::new("eval").about(
            "Emits a payload that evaluates the entrypoint on symbolic inputs",
        )))
}

impl Config {
    pub fn from_args() -> Self {
        Self::from_matches(command().get_matches())
    }

    pub fn from_matches(matches: ArgMatches) -> Self {
        let (mode, sub) = match matches.subcommand() {
            Some(("check", sub)) => (VerifyMode::Unreachable, sub),
            Some(("witness", sub)) => (VerifyMode::Witness, sub),
            Some(("eval", sub)) => (VerifyMode::Evaluate, sub),
            // Clap rejects unknown subcommands before we get here.
            _ => unreachable!(),
        };

        let src_path: PathBuf = sub.get_one::<String>("src-path").unwrap().to_owned().into();
        let entrypoint = sub.get_one::<String>("entrypoint").unwrap().to_owned();
        let target = sub
            .try_get_one::<TargetLocation>("target")
            .ok()
            .flatten()
            .cloned();

        let options = EncodeOptions {
            mode,
            target,
            int_width: *sub.get_one::<i64>("int-width").unwrap() as u32,
            large_ops: sub.get_flag("large-ops"),
        };

        let output_path: PathBuf = sub
            .get_one::<String>("output-path")
            .map(|s| s.to_owned().into())
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .unwrap()
                    .join(src_path.file_name().unwrap())
                    .with_extension("smt2")
            });

        let api_module_path = sub
            .get_one::<String>("api-module")
            .map(|s| s.to_owned().into());

        let artifact_dir = if sub.get_flag("emit-artifacts") {
            let mut dir = output_path.clone().into_os_string();
            dir.push(OsString::from("-artifacts"));
            std::fs::create_dir_all(&dir).unwrap();
            Some(ArtifactDir {
                dir_path: dir.into(),
                filename_prefix: output_path.file_name().unwrap().into(),
            })
        } else {
            None
        };

        Config {
            src_path,
            entrypoint,
            options,
            output_path,
            api_module_path,
            artifact_dir,
        }
    }
}
