pub mod config;
pub mod error;
pub mod scripting;

use std::path::PathBuf;

use clap::Parser;

use config::HostConfig;
use error::{ElgError, ErrorClass};
use scripting::{HostValue, Session};

pub use scripting::{CallOutcome, Cursor, NativeHandle, TokenView};

/// Command-line arguments of the `elg-host` driver.
#[derive(Debug, Parser)]
#[command(name = "elg-host")]
#[command(about = "Load an extension, call one of its functions and print what it emits")]
#[command(version)]
pub struct Args {
    /// JSON host configuration (ELG_* variables still apply)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Extension name, resolved as <script_dir>/<extension><suffix>
    pub extension: String,

    /// Function to call in the extension
    pub function: String,

    /// Call arguments; integers and numbers keep their type
    #[arg(allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Command-line driver.
///
/// Loads `extension`, calls `function` in mirror mode with the given
/// arguments and prints what it emitted.
pub fn run() {
    env_logger::init();

    let Args {
        config: config_path,
        extension,
        function,
        args,
    } = Args::parse();
    let call_args: Vec<HostValue> = args.iter().map(|a| parse_arg(a)).collect();

    // ── Configuration ────────────────────────────────────────────────────────
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[startup] {e}");
            std::process::exit(1);
        }
    };
    log::debug!("[startup] {config:?}");

    // ── Session ──────────────────────────────────────────────────────────────
    let mut session = Session::from_config(config);
    let result = session
        .start()
        .and_then(|_| {
            let mut output = Vec::new();
            let outcome = session.call(&extension, &function, &call_args, &mut output)?;
            Ok((outcome, output))
        })
        .and_then(|res| session.stop().map(|_| res));

    match result {
        Ok((outcome, output)) => {
            let text: String = output.into_iter().collect();
            match outcome {
                CallOutcome::Reject => eprintln!("{extension}.{function}: rejected"),
                CallOutcome::Proceed => eprintln!("{extension}.{function}: accepted"),
                CallOutcome::Emitted(_) => println!("{text}"),
                CallOutcome::Handle(h) => println!("<handle {:#x}>", h.addr()),
            }
            if !outcome.advances() {
                std::process::exit(1);
            }
        }
        Err(e) if e.class() == ErrorClass::Fatal => session.fatal(&e),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<HostConfig, ElgError> {
    let config = match path {
        Some(p) => HostConfig::from_file(&p)?,
        None => HostConfig::default(),
    };
    config.with_env_overrides()
}

/// Integers and numbers pass as such, everything else as a string.
fn parse_arg(arg: &str) -> HostValue {
    if let Ok(i) = arg.parse::<i64>() {
        HostValue::Integer(i)
    } else if let Ok(n) = arg.parse::<f64>() {
        HostValue::Number(n)
    } else {
        HostValue::from(arg)
    }
}
