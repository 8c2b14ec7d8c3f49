use clap::Parser;
use snare_lib::{
    defined_functions, undefined_functions, AddressClassifier, ProcessImage, SymbolLookup,
};

mod args;
use args::{Args, Command};

mod demo;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    match args.command {
        Command::Symbols { binary, undefined } => {
            let names = if undefined {
                undefined_functions(&binary)?
            } else {
                defined_functions(&binary)?
            };
            for name in names {
                println!("{}", name);
            }
        }
        Command::Resolve { pid, symbols } => {
            for line in resolve_lines(pid, &symbols)? {
                println!("{}", line);
            }
        }
        Command::Classify {
            base,
            bias,
            addresses,
        } => {
            for line in classify_lines(base, bias, &addresses) {
                println!("{}", line);
            }
        }
        Command::Demo {
            bias,
            max_depth,
            report_dir,
            pause,
        } => demo::run(demo::Options {
            bias,
            max_depth,
            report_dir,
            pause,
        })?,
    }

    Ok(())
}

/// One line per symbol: its runtime address in `pid` and where that lies
/// relative to the executable's base.
fn resolve_lines(pid: i32, symbols: &[String]) -> Result<Vec<String>> {
    let image = ProcessImage::for_process(pid)?;
    let classifier = AddressClassifier::new(&image);
    Ok(symbols
        .iter()
        .map(|name| match image.lookup(name) {
            Some(addr) => format!("{} {:#x} {}", name, addr, classifier.render(addr)),
            None => format!("{} not found", name),
        })
        .collect())
}

fn classify_lines(base: usize, bias: u64, addresses: &[usize]) -> Vec<String> {
    let classifier = AddressClassifier::new(&base).with_display_bias(bias);
    addresses
        .iter()
        .map(|&addr| format!("{:#x} {}", addr, classifier.render(addr)))
        .collect()
}
