#[cfg(test)]
mod test;

pub mod cli;

use attest_common::data::assembly::{Assembly, BuildError, InvokeKey, Program};
use attest_common::report_error::Reportable;
use attest_encoder::{encode_assembly, EncodeError, EncodeOutput};
use std::io;
use std::path::PathBuf;

#[derive(Debug)]
enum ErrorKind {
    ReadFailed(PathBuf, io::Error),
    ParseFailed(PathBuf, serde_json::Error),
    BuildFailed(BuildError),
    EncodeFailed(EncodeError),
    WriteFailed(PathBuf, io::Error),
}

// This type is separate from 'ErrorKind' because enums cannot have private
// variants, and the internal error types should not leak into the public API.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error { kind }
    }
}

impl Reportable for Error {
    fn report(&self, dest: &mut impl io::Write) -> io::Result<()> {
        use ErrorKind::*;
        match &self.kind {
            ReadFailed(path, err) => {
                writeln!(dest, "Could not read '{}': {}", path.display(), err)
            }
            ParseFailed(path, err) => {
                writeln!(dest, "Could not parse '{}': {}", path.display(), err)
            }
            BuildFailed(err) => writeln!(dest, "Malformed assembly: {}", err),
            EncodeFailed(err) => writeln!(dest, "Encoding failed: {}", err),
            WriteFailed(path, err) => {
                writeln!(dest, "Could not write '{}': {}", path.display(), err)
            }
        }
    }

    fn exit_status(&self) -> i32 {
        1
    }
}

pub fn handle_config(config: cli::Config) -> Result<(), Error> {
    let text = std::fs::read_to_string(&config.src_path)
        .map_err(|err| ErrorKind::ReadFailed(config.src_path.clone(), err))?;
    let assembly = Assembly::from_json(&text)
        .map_err(|err| ErrorKind::ParseFailed(config.src_path.clone(), err))?;
    let prog = Program::build(assembly).map_err(ErrorKind::BuildFailed)?;

    let entrypoint = InvokeKey(config.entrypoint.clone());
    let output =
        encode_assembly(&prog, &entrypoint, &config.options).map_err(ErrorKind::EncodeFailed)?;

    write_file(&config.output_path, &output.payload)?;
    if let Some(path) = &config.api_module_path {
        write_file(path, &to_json_pretty(&output.api_module))?;
    }
    if let Some(artifacts) = &config.artifact_dir {
        write_file(&artifacts.artifact_path("smt2"), &output.payload)?;
        write_file(
            &artifacts.artifact_path("api.json"),
            &to_json_pretty(&output.api_module),
        )?;
        write_file(&artifacts.artifact_path("faults.tsv"), &fault_table(&output))?;
    }
    Ok(())
}

fn write_file(path: &std::path::Path, content: &str) -> Result<(), Error> {
    std::fs::write(path, content)
        .map_err(|err| ErrorKind::WriteFailed(path.to_owned(), err).into())
}

fn to_json_pretty(value: &serde_json::Value) -> String {
    let mut out = serde_json::to_string_pretty(value).expect("JSON value serialization");
    out.push('\n');
    out
}

/// One line per registered fault: error code, source position, tag, message.
fn fault_table(output: &EncodeOutput) -> String {
    let mut out = String::new();
    for (id, info) in &output.faults.infos {
        out.push_str(&format!(
            "{}\t{}:{}:{}\t{}\t{}\n",
            output.faults.error_code(id),
            info.file,
            info.line,
            info.pos,
            info.tag,
            info.msg,
        ));
    }
    out
}
