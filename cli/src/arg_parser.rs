use clap::{ArgEnum, Args, Parser, Subcommand};

/// Run array jobs on the local worker pool
#[derive(Debug, Parser)]
pub struct ArgParser {
    /// vCPUs offered by the local pool
    #[clap(long, env = "BATCH_MAX_VCPUS", default_value = "256")]
    pub max_vcpus: u32,

    /// time an item waits in RUNNABLE before it may start, in milliseconds
    #[clap(long, env = "BATCH_START_DELAY_MS", default_value = "250")]
    pub start_delay_ms: u64,

    /// first status poll interval, in milliseconds (1 to 3600000)
    #[clap(long, env = "BATCH_POLL_INITIAL_MS", default_value = "1000", parse(try_from_str = self::poll_initial_ms))]
    pub poll_initial_ms: u64,

    /// longest status poll interval, in seconds (1 to 3600)
    #[clap(long, env = "BATCH_POLL_MAX_SECS", default_value = "60", parse(try_from_str = self::poll_max_secs))]
    pub poll_max_secs: u64,

    /// largest array job; bigger maps are split
    #[clap(long, env = "BATCH_MAX_ARRAY_SIZE", default_value = "10000")]
    pub max_array_size: usize,

    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum SubCommand {
    /// map an entry point over evenly spaced inputs
    Map {
        #[clap(arg_enum)]
        /// entry point to run
        entry: Entry,

        #[clap(long, default_value = "0.1")]
        start: f64,

        #[clap(long, default_value = "100")]
        stop: f64,

        #[clap(long, default_value = "17")]
        /// number of inputs, one array item each
        num: usize,

        #[clap(flatten)]
        job: JobArgs,
    },
    /// run an entry point once
    Submit {
        #[clap(arg_enum)]
        /// entry point to run
        entry: Entry,

        /// argument passed to the entry point
        argument: f64,

        #[clap(flatten)]
        job: JobArgs,
    },
}

#[derive(Clone, Debug, PartialEq, Args)]
pub struct JobArgs {
    #[clap(long, env = "BATCH_MEMORY_MIB", default_value = "32000")]
    /// memory per item, in MiB
    pub memory: u32,

    #[clap(long, env = "BATCH_VCPUS", default_value = "1")]
    pub vcpus: u32,

    #[clap(long, env = "BATCH_RETRIES", default_value = "1")]
    /// attempts per item, 1 to 10
    pub retries: u32,

    #[clap(long, multiple_values = true, parse(try_from_str = var_eq_val))]
    /// list of environment variables
    pub envs: Vec<(String, String)>,

    #[clap(long)]
    /// give up waiting after this many seconds
    pub timeout: Option<u64>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
pub enum Entry {
    /// x * x
    Square,
    /// cube root of x
    CubeRoot,
    /// fails the first attempt of every even index
    Flaky,
}

fn in_range(s: &str, min: u64, max: u64) -> Result<u64, String> {
    let value: u64 = s.parse().map_err(|err| format!("{}", err))?;
    if value < min || value > max {
        return Err(format!("must be between {} and {}", min, max));
    }
    Ok(value)
}

fn poll_initial_ms(s: &str) -> Result<u64, String> {
    in_range(s, 1, 3_600_000)
}

fn poll_max_secs(s: &str) -> Result<u64, String> {
    in_range(s, 1, 3_600)
}

/// try_from_str parse function for environment variables
fn var_eq_val(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((var, val)) if !var.is_empty() => Ok((var.to_string(), val.to_string())),
        _ => Err("Required format is VAR=VAL".to_string()),
    }
}
