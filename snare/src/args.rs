use std::{num::ParseIntError, path::PathBuf};

#[derive(clap::Parser)]
#[clap(about = "Function interception and frame-pointer backtraces")]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand)]
pub enum Command {
    /// List the function symbols of an elf.
    Symbols {
        binary: PathBuf,
        /// List the functions the binary imports instead of the ones it defines.
        #[clap(short = 'u', long)]
        undefined: bool,
    },
    /// Resolve symbols of a running process to runtime addresses.
    Resolve {
        #[clap(short = 'p', long)]
        pid: i32,
        #[clap(required = true)]
        symbols: Vec<String>,
    },
    /// Translate raw addresses into offsets relative to a module base.
    Classify {
        #[clap(short = 'b', long, parse(try_from_str = parse_addr))]
        base: usize,
        /// Added to module-relative offsets, e.g. `7100000000`.
        #[clap(long, default_value = "0", parse(try_from_str = parse_bias))]
        bias: u64,
        #[clap(required = true, parse(try_from_str = parse_addr))]
        addresses: Vec<usize>,
    },
    /// Hook `getpid` and `close` in this process and report what they see.
    Demo {
        /// Added to module-relative offsets, e.g. `7100000000`.
        #[clap(long, default_value = "0", parse(try_from_str = parse_bias))]
        bias: u64,
        #[clap(long, default_value = "32")]
        max_depth: usize,
        /// Persist a backtrace report for every watched file that gets closed.
        #[clap(long)]
        report_dir: Option<PathBuf>,
        /// Stop after installing the hooks until `c` is entered.
        #[clap(long)]
        pause: bool,
    },
}

/// Accepts `0x1234` as well as bare `1234`, both read as hex.
pub fn parse_addr(s: &str) -> Result<usize, ParseIntError> {
    usize::from_str_radix(strip_hex_prefix(s), 16)
}

pub fn parse_bias(s: &str) -> Result<u64, ParseIntError> {
    u64::from_str_radix(strip_hex_prefix(s), 16)
}

fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}
