use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scrivener::{projection_to_json, protocol_to_json};
use scrivener_compiler::error::CompileError;
use scrivener_compiler::tokenizer::read_tokens;
use scrivener_compiler::{compile_files, write_module, CompileOptions, GenOptions, ParseOptions};

#[derive(Parser)]
#[command(name = "scrivener")]
#[command(about = "Compile local Scribble protocols into typestate Rust APIs", long_about = None)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the token stream of a protocol file
    Tokens {
        /// Input protocol file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Parse a protocol file and print its tree as JSON
    Parse {
        /// Input protocol file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Project every local protocol in a file and print the projections as JSON
    Project {
        /// Input protocol file
        #[arg(short, long)]
        input: PathBuf,
    },

    /// Generate a typestate Rust module from one or more protocol files
    GenRust {
        /// Input protocol files; more than one produces a combined module
        #[arg(short, long, required = true)]
        input: Vec<PathBuf>,

        /// Name of the generated module
        #[arg(short, long, default_value = "protocol")]
        module: String,

        /// Output directory; the module is written to `<DIR>/<MODULE>/mod.rs` (prints to stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Parse sections and branches in parallel
        #[arg(long)]
        parallel: bool,

        /// Wrap the output in `pub mod <MODULE>` for use with `include!`
        #[arg(long)]
        inline: bool,
    },
}

fn main() -> Result<(), CompileError> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().without_time().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        Commands::Tokens { input } => {
            for token in read_tokens(input)? {
                println!("{}:{}\t{}", token.line, token.column, token.text);
            }
            Ok(())
        }

        Commands::Parse { input } => {
            let text = fs::read_to_string(input)?;
            println!("{}", protocol_to_json(&text)?);
            Ok(())
        }

        Commands::Project { input } => {
            let text = fs::read_to_string(input)?;
            println!("{}", projection_to_json(&text)?);
            Ok(())
        }

        Commands::GenRust { input, module, output, parallel, inline } => {
            let options = CompileOptions {
                parse: ParseOptions { parallel: *parallel },
                gen:   GenOptions { module_name: module.clone(), inline: *inline },
            };
            // Everything is generated in memory first; an error leaves no output behind.
            let rust_code = compile_files(input, &options)?;
            if let Some(dir) = output {
                let path = write_module(dir, module, &rust_code)?;
                tracing::info!("Generated Rust code written to {}", path.display());
            } else {
                println!("{}", rust_code);
            }
            Ok(())
        }
    }
}
