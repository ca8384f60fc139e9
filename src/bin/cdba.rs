//! cdba command line interface (the operator client).

use std::path::PathBuf;
use std::process;

use clap::{ArgAction, Parser};
use console::style;
use tracing_subscriber::EnvFilter;

use cdba::client::{Mode, Outcome, RawGuard, RemoteTransport, Session, SessionConfig};

/// `-h` selects the remote host, so the automatic short help flag is
/// disabled; `--help` remains.
#[derive(Parser, Debug)]
#[command(
    name = "cdba",
    version,
    about = "Remote control of development boards",
    disable_help_flag = true
)]
struct Args {
    /// Board to operate on (boot and info modes)
    #[arg(short = 'b', value_name = "BOARD")]
    board: Option<String>,

    /// Host the board is attached to
    #[arg(short = 'h', value_name = "HOST")]
    host: String,

    /// Total session timeout in seconds
    #[arg(short = 't', value_name = "SEC", default_value_t = 600)]
    timeout_total: u64,

    /// Inactivity timeout in seconds; 0 disables
    #[arg(short = 'T', value_name = "SEC", default_value_t = 0)]
    timeout_inactivity: u64,

    /// Power cycles to spend on power-off or timeout triggers
    #[arg(short = 'c', value_name = "N", conflicts_with = "cycles_no_timeout")]
    cycles: Option<u32>,

    /// Power cycles to spend, but never on a timeout
    #[arg(short = 'C', value_name = "N")]
    cycles_no_timeout: Option<u32>,

    /// Print the selected board's details and exit
    #[arg(short = 'i')]
    info: bool,

    /// List accessible boards and exit
    #[arg(short = 'l')]
    list: bool,

    /// Re-send the image every time the board re-enters flashing mode
    #[arg(short = 'R')]
    repeat: bool,

    /// Server binary to launch on the host
    #[arg(short = 'S', value_name = "PATH", default_value = "cdba-server")]
    server: String,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Boot image to flash (boot mode)
    #[arg(value_name = "BOOT_IMAGE")]
    image: Option<PathBuf>,
}

fn usage_error(msg: &str) -> ! {
    eprintln!("{}: {msg}", style("error").red());
    process::exit(1);
}

fn session_config(args: &Args) -> SessionConfig {
    let mode = if args.list {
        Mode::List
    } else if args.info {
        match &args.board {
            Some(board) => Mode::Info {
                board: board.clone(),
            },
            None => usage_error("info mode needs a board (-b)"),
        }
    } else {
        let board = args
            .board
            .clone()
            .unwrap_or_else(|| usage_error("boot mode needs a board (-b)"));
        let image = args
            .image
            .clone()
            .unwrap_or_else(|| usage_error("boot mode needs a boot image"));
        Mode::Boot {
            board,
            image,
            repeat: args.repeat,
        }
    };

    let mut cfg = SessionConfig::new(mode);
    cfg.timeout_total = std::time::Duration::from_secs(args.timeout_total);
    if args.timeout_inactivity > 0 {
        cfg.timeout_inactivity = Some(std::time::Duration::from_secs(args.timeout_inactivity));
    }
    match (args.cycles, args.cycles_no_timeout) {
        (Some(n), _) => cfg.power_cycles = n,
        (None, Some(n)) => {
            cfg.power_cycles = n;
            cfg.cycle_on_timeout = false;
        }
        (None, None) => {}
    }
    cfg
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run(args: Args) -> i32 {
    let cfg = session_config(&args);
    let booting = matches!(cfg.mode, Mode::Boot { .. });

    let transport = match RemoteTransport::spawn(&args.host, &args.server) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("{}: {err}", style("error").red());
            return 1;
        }
    };
    let (mut child, stdin, stdout, stderr) = transport.into_parts();

    // Raw mode for keystroke forwarding; the guard restores the terminal
    // on every exit path out of this function.
    let raw = match RawGuard::enable() {
        Ok(raw) => raw,
        Err(err) => {
            eprintln!("{}: {err}", style("error").red());
            return 1;
        }
    };

    let mut session = Session::new(cfg, stdout, stdin).with_remote_stderr(stderr);
    if raw.is_some() {
        session = session.with_operator_input(tokio::io::stdin());
    }

    let code = match session.run().await {
        Ok(outcome) => {
            if let Outcome::TimedOut { .. } = outcome {
                eprintln!("{}", style("session timed out").yellow());
            }
            outcome.exit_code()
        }
        Err(err) => {
            eprintln!("{}: {err}", style("error").red());
            1
        }
    };

    // The session dropped the server's stdin; the remote shell winds down.
    if booting {
        println!("Waiting for ssh to finish");
    }
    let _ = child.wait().await;

    code
}

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("{}: {err}", style("error").red());
            process::exit(1);
        }
    };

    let code = runtime.block_on(run(args));
    process::exit(code);
}
