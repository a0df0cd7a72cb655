//! CLI entry point for the cpulink runner binary.

use std::collections::BTreeMap;
use std::env;
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use cpulink_minicore as _;
use cpulink_protocol::{Environment, API_VERSION};
use cpulink_runner::{default_registry, MemoryRegion, RunnerEnv, Scheduler};
use thiserror as _;

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
#[cfg(test)]
use tempfile as _;

const USAGE_TEXT: &str = "\
Usage: cpulink-run -b <image> [options] [name=value ...] <provider> <variant>

Arguments:
  -b <file>   raw binary image to load into memory
  -m <size>   simulated memory size in bytes (default 0x8000000)
  -a <align>  memory alignment in bytes (default 0x1000)
  -q <n>      instructions per quantum (default 1000000)
  -n <cores>  number of core instances (default 1)
  -o <addr>   memory-mapped output port address (default 0x40000000)
  -r <addr>   reset program counter (default 0)
  name=value  configuration parameter exposed to cores
  <provider>  the core provider to resolve
  <variant>   the core variant to instantiate

Numbers accept decimal or 0x-prefixed hexadecimal.

Example:
  cpulink-run -b image.bin -n 2 -q 100000 cpulink-minicore mini32
";

#[derive(Debug, PartialEq, Eq)]
struct RunConfig {
    image: PathBuf,
    mem_size: u64,
    mem_align: u64,
    quantum: u64,
    cores: u64,
    port_addr: u64,
    reset_pc: u64,
    params: BTreeMap<String, String>,
    provider: String,
    variant: String,
}

#[derive(Debug)]
enum ParseResult {
    Run(Box<RunConfig>),
    Help,
}

fn parse_number(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let parsed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .map_or_else(
            || trimmed.parse(),
            |hex| u64::from_str_radix(hex, 16),
        );
    parsed.map_err(|_| format!("invalid number: {raw}"))
}

#[allow(clippy::too_many_lines)]
fn parse_args(mut args: impl Iterator<Item = OsString>) -> Result<ParseResult, String> {
    let mut image: Option<PathBuf> = None;
    let mut mem_size: u64 = 0x0800_0000;
    let mut mem_align: u64 = 0x1000;
    let mut quantum: u64 = 1_000_000;
    let mut cores: u64 = 1;
    let mut port_addr: u64 = 0x4000_0000;
    let mut reset_pc: u64 = 0;
    let mut params = BTreeMap::new();
    let mut positionals: Vec<String> = Vec::new();

    while let Some(arg) = args.next() {
        if arg == "--help" || arg == "-h" {
            return Ok(ParseResult::Help);
        }

        let text = arg.to_string_lossy().to_string();
        match text.as_str() {
            "-b" | "-m" | "-a" | "-q" | "-n" | "-o" | "-r" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for {text}"))?;
                let value = value.to_string_lossy().to_string();
                match text.as_str() {
                    "-b" => image = Some(PathBuf::from(value)),
                    "-m" => mem_size = parse_number(&value)?,
                    "-a" => mem_align = parse_number(&value)?,
                    "-q" => quantum = parse_number(&value)?,
                    "-n" => cores = parse_number(&value)?,
                    "-o" => port_addr = parse_number(&value)?,
                    "-r" => reset_pc = parse_number(&value)?,
                    _ => unreachable!("guarded by the outer match"),
                }
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            other => {
                if let Some((name, value)) = other.split_once('=') {
                    if name.is_empty() {
                        return Err(format!("invalid parameter: {other}"));
                    }
                    params.insert(name.to_owned(), value.to_owned());
                } else {
                    positionals.push(other.to_owned());
                }
            }
        }
    }

    let image = image.ok_or_else(|| "binary image must be specified with -b".to_owned())?;

    if quantum == 0 {
        return Err("quantum must be nonzero".to_owned());
    }
    if cores == 0 {
        return Err("core count must be nonzero".to_owned());
    }

    let [provider, variant] = <[String; 2]>::try_from(positionals)
        .map_err(|_| "provider and variant must be specified".to_owned())?;

    Ok(ParseResult::Run(Box::new(RunConfig {
        image,
        mem_size,
        mem_align,
        quantum,
        cores,
        port_addr,
        reset_pc,
        params,
        provider,
        variant,
    })))
}

fn run(config: RunConfig) -> Result<(), String> {
    let registry = default_registry();
    let factory = registry
        .resolve(&config.provider)
        .ok_or_else(|| format!("unknown core provider {:?}", config.provider))?;

    let mut region = MemoryRegion::new(config.mem_size, config.mem_align)
        .map_err(|error| error.to_string())?;
    println!("Allocated 0x{:x} bytes of memory", region.size());

    let loaded = region.load(&config.image).map_err(|error| error.to_string())?;
    println!("Loaded {} ({loaded} bytes)", config.image.display());

    let env = Arc::new(RunnerEnv::new(region, config.port_addr, config.params));

    let mut cores = Vec::new();
    for _ in 0..config.cores {
        let core = factory
            .create(
                API_VERSION,
                Arc::clone(&env) as Arc<dyn Environment>,
                &config.variant,
            )
            .ok_or_else(|| {
                format!(
                    "failed to create core variant {:?} from provider {:?}",
                    config.variant, config.provider
                )
            })?;
        println!("Created core {} ({})", core.arch(), core.provider());
        cores.push(core);
    }

    println!("Starting simulation with quantum {}", config.quantum);
    let scheduler = Scheduler::launch(&env, cores, config.quantum, config.reset_pc);
    let reports = scheduler.join();

    for report in reports {
        println!(
            "Core {} executed {} instructions ({:?})",
            report.core_index, report.instructions, report.state
        );
    }
    println!("Simulated time: {} ps", env.time_ps());

    Ok(())
}

fn main() {
    let exit_code = match parse_args(env::args_os().skip(1)) {
        Ok(ParseResult::Help) => {
            println!("{USAGE_TEXT}");
            0
        }
        Ok(ParseResult::Run(config)) => match run(*config) {
            Ok(()) => 0,
            Err(error) => {
                eprintln!("error: {error}");
                1
            }
        },
        Err(error) => {
            eprintln!("error: {error}");
            eprintln!("{USAGE_TEXT}");
            1
        }
    };

    std::process::exit(exit_code);
}
