// When 'lib.rs' exists, cargo treats 'main.rs' as a separate crate
use attest_common::report_error::Reportable;
use attest_compiler::cli::Config;
use attest_compiler::handle_config;

use std::io;

fn main() {
    better_panic::install();

    let config = Config::from_args();
    if let Err(err) = handle_config(config) {
        let _ = err.report(&mut io::stderr().lock());
        std::process::exit(err.exit_status());
    }
}
