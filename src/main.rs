use clap::{ArgAction, ArgGroup, Parser};
use shtest::loader;
use shtest::logging;
use shtest::runner::{RUN_ONE_VERBOSITY, Runner, RunnerOptions};
use shtest::schema;
use std::path::{self, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "shtest")]
#[command(about = "A script-driven test harness for command-line programs")]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["all", "one", "info"])))]
struct Cli {
    /// Run all test files in the base directory
    #[arg(short = 'A')]
    all: bool,

    /// Also run test files in subdirectories (with -A)
    #[arg(short = 'a', requires = "all")]
    recursive: bool,

    /// Run one test file matching a glob, or the last failed one
    #[arg(short = 'O', value_name = "NAME", num_args = 0..=1)]
    one: Option<Option<String>>,

    /// Script run in each session before the test file body
    #[arg(short = 's', value_name = "PATH")]
    setup: Option<PathBuf>,

    /// Directory holding the test files
    #[arg(short = 'd', value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Increase verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Print the test file format as JSON Schema
    #[arg(short = 'i')]
    info: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    if cli.info {
        let schema = schema::generate_schema();
        match serde_json::to_string_pretty(&schema) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Error serializing schema: {e}");
                process::exit(1);
            }
        }
        return;
    }

    let verbosity = if cli.one.is_some() {
        cli.verbose.max(RUN_ONE_VERBOSITY)
    } else {
        cli.verbose
    };
    logging::init(verbosity);
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let dir = cli.dir.unwrap_or_else(|| PathBuf::from("."));
    let base_dir = match dir.canonicalize() {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("Error: cannot use {} as base directory: {e}", dir.display());
            return 1;
        }
    };

    let config = match loader::load_suite_config(&base_dir) {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Error loading suite config: {e}");
            return 1;
        }
    };

    // -s is relative to where shtest was started, not to the base directory.
    let local_setup = match cli.setup.map(|p| path::absolute(&p)).transpose() {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: invalid setup path: {e}");
            return 1;
        }
    };

    let runner = Runner::new(RunnerOptions {
        base_dir,
        verbosity: cli.verbose,
        local_setup,
        config,
    });

    let result = match cli.one {
        Some(name) => runner.run_one(name.as_deref()),
        None => runner
            .discover(cli.recursive)
            .and_then(|files| runner.run_all(&files)),
    };

    match result {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("Error: {e}");
            e.exit_code()
        }
    }
}
