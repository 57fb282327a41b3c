//! Command-line interface for the crashcap supervisor.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use libcrashcap::capture::DEFAULT_STACK_FRAMES;
use libcrashcap::engine::{DumpFormat, DumpRequest};
use libcrashcap::exception::ClassifierPolicy;
use libcrashcap::supervisor::SETUP_FAILURE_EXIT_CODE;
use libcrashcap::watchdog::WatchdogPolicy;
use libcrashcap::{CommandLine, SupervisorConfig};
use log::{debug, error};

/// Run a program and capture its state the moment it crashes, asserts, or hangs.
#[derive(Parser, Debug)]
#[command(name = "crashcap", version, disable_help_flag = true, long_about = None)]
struct Cli {
    /// Print help.
    #[arg(short = 'h', long = "help", short_alias = '?', action = ArgAction::Help)]
    help: Option<bool>,

    /// Show all debugger output and debug logging.
    #[arg(short, long)]
    verbose: bool,

    /// Symbol search path.
    #[arg(short = 'y', long, value_name = "PATH", env = "_NT_SYMBOL_PATH")]
    symbol_path: Option<String>,

    /// Dump file to write on capture.
    #[arg(short = 'z', long, value_name = "FILE")]
    dump: Option<PathBuf>,

    #[arg(short = 'f', long, value_enum, default_value_t = DumpFormatArg::Minimal)]
    dump_format: DumpFormatArg,

    /// Capture once the program has run this long; 0 means no limit.
    #[arg(short = 't', long, value_name = "SECONDS", default_value_t = 0)]
    timeout: u64,

    /// Capture fatal first-chance exceptions before the program's handlers run.
    #[arg(long)]
    capture_first_chance: bool,

    /// Capture after this many first-chance illegal instructions.
    #[arg(long, value_name = "N")]
    illegal_instruction_threshold: Option<u32>,

    /// Do not break on abort and assertion routines.
    #[arg(long)]
    no_abort_breakpoints: bool,

    /// Frames shown per thread.
    #[arg(long, value_name = "N", default_value_t = DEFAULT_STACK_FRAMES)]
    stack_frames: usize,

    /// Program to run, followed by its arguments.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum DumpFormatArg {
    Minimal,
    Full,
}

impl From<DumpFormatArg> for DumpFormat {
    fn from(format: DumpFormatArg) -> Self {
        match format {
            DumpFormatArg::Minimal => DumpFormat::Minimal,
            DumpFormatArg::Full => DumpFormat::Full,
        }
    }
}

impl Cli {
    fn config(&self) -> SupervisorConfig {
        SupervisorConfig {
            verbose: self.verbose,
            symbol_path: self.symbol_path.clone(),
            dump: DumpRequest {
                path: self.dump.clone(),
                format: self.dump_format.into(),
            },
            watchdog: WatchdogPolicy::with_timeout_secs(self.timeout),
            classifier: ClassifierPolicy {
                capture_first_chance: self.capture_first_chance,
            },
            illegal_instruction_threshold: self.illegal_instruction_threshold,
            abort_breakpoints: !self.no_abort_breakpoints,
            stack_frames: self.stack_frames,
            ..SupervisorConfig::default()
        }
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(if err.use_stderr() { SETUP_FAILURE_EXIT_CODE } else { 0 });
        }
    };

    let filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let code = match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            SETUP_FAILURE_EXIT_CODE
        }
    };
    process::exit(code);
}

fn run(cli: &Cli) -> Result<i32> {
    let command_line = CommandLine::from_args(&cli.command).context("invalid command line")?;
    debug!("command line: {command_line}");
    supervise(cli.config(), command_line.as_str())
}

#[cfg(target_os = "linux")]
fn supervise(config: SupervisorConfig, command_line: &str) -> Result<i32> {
    use std::io::IsTerminal;
    use std::sync::Arc;

    use libcrashcap::Supervisor;
    use libcrashcap::ptrace::PtraceEngine;
    use libcrashcap::watchdog::{DialogDetector, NoDialogDetector, TerminalPromptDetector};

    // With someone at the terminal a prompt is not a hang.
    let detector: Arc<dyn DialogDetector> = if std::io::stdin().is_terminal() {
        Arc::new(NoDialogDetector)
    } else {
        Arc::new(TerminalPromptDetector)
    };

    let mut supervisor = Supervisor::new(PtraceEngine::new(), config).with_dialog_detector(detector);
    Ok(supervisor.start(command_line))
}

#[cfg(not(target_os = "linux"))]
fn supervise(_config: SupervisorConfig, _command_line: &str) -> Result<i32> {
    anyhow::bail!("crashcap {} supports Linux only", libcrashcap::version())
}
