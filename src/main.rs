//! stagerun CLI Entry Point
//!
//! Runs a single process declared through command-line flags.
//!
//! # Usage
//!
//! ```bash
//! # Copy a file through a staged script
//! stagerun --name copy --input a=data/a.txt --output b=b.txt --script 'cp "$a" "$b"'
//!
//! # Script from a file, copy staging, custom staging root
//! stagerun --name qc --input reads=reads.fq --output report=qc.html \
//!     --script-file qc.sh --staging copy --workdir /scratch/runs
//!
//! # Submit to Slurm, polling every 10 s, giving up after an hour
//! stagerun --executor slurm --poll 10 --deadline 3600 --name sort ...
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use colored::Colorize;
use log::{error, info, warn};

use stagerun::execution::{ClusterRunner, SlurmScheduler};
use stagerun::{
    executor, Executor, GenericExecutor, ProcessSpec, StagingManager, StagingMode, APP_NAME,
    VERSION,
};

/// Executor used when none is specified.
const DEFAULT_EXECUTOR: &str = "default";

/// Flags that take a value.
const VALUE_FLAGS: &[&str] = &[
    "--name",
    "--input",
    "--output",
    "--arg",
    "--script",
    "--script-file",
    "--executor",
    "--staging",
    "--workdir",
    "--deadline",
    "--poll",
];

/// Where the script text comes from.
#[derive(Debug)]
enum ScriptSource {
    Inline(String),
    File(PathBuf),
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    name: Option<String>,
    inputs: Vec<(String, String)>,
    outputs: Vec<(String, String)>,
    args: Vec<(String, String)>,
    script: Option<ScriptSource>,
    executor: String,
    staging: Option<StagingMode>,
    workdir: Option<PathBuf>,
    deadline: Option<Duration>,
    poll: Option<Duration>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            args: Vec::new(),
            script: None,
            executor: DEFAULT_EXECUTOR.to_string(),
            staging: None,
            workdir: None,
            deadline: None,
            poll: None,
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Staged Process Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: stagerun --name NAME [--script TEXT | --script-file PATH] [OPTIONS]");
    println!();
    println!("Declaration:");
    println!("  --name NAME           Process name (namespaces the staging directory)");
    println!("  --input KEY=PATH      Declare an input (repeatable)");
    println!("  --output KEY=PATH     Declare an output relative to the staging directory (repeatable)");
    println!("  --arg KEY=VALUE       Declare a scalar argument (repeatable)");
    println!("  --script TEXT         Script template");
    println!("  --script-file PATH    Read the script template from a file");
    println!();
    println!("Execution:");
    println!("  --executor NAME       default, local, cluster or slurm (default: {})", DEFAULT_EXECUTOR);
    println!("  --staging MODE        copy or in-place (default: in-place)");
    println!("  --workdir PATH        Staging root (default: $STAGERUN_WORKDIR or ./stagerun_work)");
    println!("  --deadline SECS       Cluster only: cancel the job after SECS seconds");
    println!("  --poll SECS           Cluster only: status polling interval");
    println!();
    println!("Options:");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  stagerun --name copy --input a=a.txt --output b=b.txt --script 'cp \"$a\" \"$b\"'");
    println!("  stagerun --executor slurm --deadline 3600 --name sort --script-file sort.sh");
}

/// Splits a `KEY=VALUE` argument.
fn parse_pair(flag: &str, value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, val)) if !key.is_empty() => Ok((key.to_string(), val.to_string())),
        _ => Err(format!("{} expects KEY=VALUE, got '{}'", flag, value)),
    }
}

/// Parses a non-negative number of seconds.
fn parse_seconds(flag: &str, value: &str) -> Result<Duration, String> {
    value
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| format!("Invalid {} value: {}", flag, value))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = args[i].as_str();

        if matches!(arg, "--help" | "-h") {
            print_usage();
            std::process::exit(0);
        }
        if matches!(arg, "--version" | "-V") {
            println!("{} {}", APP_NAME, VERSION);
            std::process::exit(0);
        }
        if matches!(arg, "--verbose" | "-v") {
            config.verbose = true;
            i += 1;
            continue;
        }

        if !arg.starts_with('-') {
            return Err(format!("Unexpected argument: {}", arg));
        }
        if !VALUE_FLAGS.contains(&arg) {
            return Err(format!("Unknown option: {}", arg));
        }

        i += 1;
        let Some(value) = args.get(i) else {
            return Err(format!("{} requires a value", arg));
        };

        match arg {
            "--name" => config.name = Some(value.clone()),
            "--input" => config.inputs.push(parse_pair(arg, value)?),
            "--output" => config.outputs.push(parse_pair(arg, value)?),
            "--arg" => config.args.push(parse_pair(arg, value)?),
            "--script" => config.script = Some(ScriptSource::Inline(value.clone())),
            "--script-file" => config.script = Some(ScriptSource::File(PathBuf::from(value))),
            "--executor" => config.executor = value.clone(),
            "--staging" => {
                let mode = value.parse::<StagingMode>().map_err(|e| e.to_string())?;
                config.staging = Some(mode);
            }
            "--workdir" => config.workdir = Some(PathBuf::from(value)),
            "--deadline" => config.deadline = Some(parse_seconds(arg, value)?),
            "--poll" => config.poll = Some(parse_seconds(arg, value)?),
            _ => return Err(format!("Unknown option: {}", arg)),
        }
        i += 1;
    }

    if config.name.is_none() {
        return Err("--name is required".to_string());
    }
    if config.script.is_none() {
        return Err("one of --script or --script-file is required".to_string());
    }

    Ok(config)
}

/// Builds the process declaration from the parsed flags.
fn build_process(config: &Config) -> Result<ProcessSpec, Box<dyn std::error::Error>> {
    let script = match &config.script {
        Some(ScriptSource::Inline(text)) => text.clone(),
        Some(ScriptSource::File(path)) => fs::read_to_string(path).map_err(|e| {
            format!("Could not read script file '{}': {}", path.display(), e)
        })?,
        None => String::new(),
    };

    let mut builder = ProcessSpec::builder(config.name.clone().unwrap_or_default()).script(script);
    for (key, path) in &config.inputs {
        builder = builder.input(key, path);
    }
    for (key, path) in &config.outputs {
        builder = builder.output(key, path);
    }
    for (key, value) in &config.args {
        builder = builder.arg(key, value.as_str());
    }

    Ok(builder.build()?)
}

/// Creates the executor and applies the flags that configure it.
fn build_executor(config: &Config) -> Result<GenericExecutor, Box<dyn std::error::Error>> {
    let mut runner = executor(&config.executor)?;

    if let Some(root) = &config.workdir {
        let manager = StagingManager::new(root);
        runner = match runner {
            GenericExecutor::Local(local) => local.with_staging_manager(manager).into(),
            GenericExecutor::Cluster(cluster) => (*cluster).with_staging_manager(manager).into(),
        };
    }

    runner = match runner {
        GenericExecutor::Cluster(cluster) => {
            let mut cluster: ClusterRunner<SlurmScheduler> = *cluster;
            if let Some(poll) = config.poll {
                cluster = cluster.with_poll_interval(poll);
            }
            if let Some(deadline) = config.deadline {
                cluster = cluster.with_deadline(deadline);
            }
            cluster.into()
        }
        local => {
            if config.poll.is_some() || config.deadline.is_some() {
                warn!("--poll and --deadline only apply to cluster executors");
            }
            local
        }
    };

    if let Some(mode) = config.staging {
        runner.set_staging_mode(mode);
    }

    Ok(runner)
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let process = build_process(&config)?;
    let runner = build_executor(&config)?;

    info!(
        "Executor: {} (staging: {}, root: {})",
        runner.backend(),
        runner.staging_mode(),
        runner.staging_manager().root().display()
    );

    let result = runner.execute(&process).map_err(|e| {
        error!("Execution of '{}' failed", process.name());
        e
    })?;

    println!();
    println!("{} '{}'", "Completed".green().bold(), process.name());
    for (key, path) in process.outputs().keys().zip(result.outputs()) {
        println!("  {} {}", format!("{:12}", key).cyan(), path.display());
    }
    println!("  {} {}", format!("{:12}", "staging").dimmed(), result.staging_dir().display());
    if let Some(usage) = result.usage() {
        println!("  {} {}", format!("{:12}", "resources").dimmed(), usage);
    }
    println!(
        "  {} {:.2}s",
        format!("{:12}", "elapsed").dimmed(),
        result.elapsed().as_secs_f64()
    );

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("stagerun")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_full_declaration() {
        let config = parse_arguments(&argv(&[
            "--name", "copy", "--input", "a=in.txt", "--output", "b=out.txt", "--arg",
            "n=3", "--script", "cp $a $b", "--staging", "copy", "--verbose",
        ]))
        .unwrap();

        assert_eq!(config.name.as_deref(), Some("copy"));
        assert_eq!(config.inputs, vec![("a".to_string(), "in.txt".to_string())]);
        assert_eq!(config.outputs, vec![("b".to_string(), "out.txt".to_string())]);
        assert_eq!(config.args, vec![("n".to_string(), "3".to_string())]);
        assert_eq!(config.staging, Some(StagingMode::Copy));
        assert_eq!(config.executor, DEFAULT_EXECUTOR);
        assert!(config.verbose);
    }

    #[test]
    fn test_parse_requires_name_and_script() {
        assert!(parse_arguments(&argv(&["--script", "true"])).is_err());
        assert!(parse_arguments(&argv(&["--name", "x"])).is_err());
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(parse_arguments(&argv(&["--name", "x", "--script", "t", "--bogus"])).is_err());
        assert!(parse_arguments(&argv(&["--name", "x", "--script", "t", "--input", "noeq"])).is_err());
        assert!(parse_arguments(&argv(&["--name", "x", "--script", "t", "--staging", "hard"])).is_err());
        assert!(parse_arguments(&argv(&["--name", "x", "--script", "t", "--deadline", "-1"])).is_err());
        assert!(parse_arguments(&argv(&["--name", "x", "--script"])).is_err());
    }

    #[test]
    fn test_parse_pair_keeps_equals_in_value() {
        assert_eq!(
            parse_pair("--arg", "expr=a=b").unwrap(),
            ("expr".to_string(), "a=b".to_string())
        );
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_seconds("--poll", "2.5").unwrap(), Duration::from_millis(2500));
        assert!(parse_seconds("--poll", "soon").is_err());
        assert!(parse_seconds("--poll", "-1").is_err());
        assert_eq!(
            parse_seconds("--deadline", "1e30").unwrap_err(),
            "Invalid --deadline value: 1e30"
        );
    }

    #[test]
    fn test_build_executor_applies_cluster_flags() {
        let config = parse_arguments(&argv(&[
            "--name", "x", "--script", "true", "--executor", "slurm", "--poll", "1",
            "--deadline", "60", "--workdir", "/tmp/stagerun-test",
        ]))
        .unwrap();

        match build_executor(&config).unwrap() {
            GenericExecutor::Cluster(cluster) => {
                assert_eq!(cluster.poll_interval(), Duration::from_secs(1));
                assert_eq!(cluster.deadline(), Some(Duration::from_secs(60)));
                assert_eq!(
                    cluster.staging_manager().root(),
                    std::path::Path::new("/tmp/stagerun-test")
                );
            }
            GenericExecutor::Local(_) => panic!("expected a cluster executor"),
        }
    }
}
