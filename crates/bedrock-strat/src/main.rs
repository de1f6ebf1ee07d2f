//! # strat
//!
//! Run the specified stratum's instance of an executable.

use clap::Parser;
use nix::errno::Errno;

use bedrock_core::{logging, CROSS_DIR};
use bedrock_strat::exec::execv_skip;
use bedrock_strat::restrict::{cmd_is_restricted, restrict_env};
use bedrock_strat::switch::{switch_stratum, RootMode};

const EXAMPLES: &str = "\
Examples:
  Run centos's ls command:
  $ strat centos ls
  Run gentoo's busybox with arg0=\"ls\":
  $ strat --arg0 ls gentoo busybox
  By default make is unrestricted.
  Run debian's make restricted to only debian's files:
  $ strat -r debian make
  By default makepkg is restricted.
  Run arch's makepkg without restricting it to arch's files:
  $ strat -u arch makepkg";

/// Run the specified stratum's instance of an executable
#[derive(Parser)]
#[command(name = "strat", version, about, after_help = EXAMPLES)]
struct Cli {
    /// Disable cross-stratum hooks
    #[arg(short = 'r', long = "restrict", conflicts_with = "unrestrict")]
    restrict: bool,

    /// Do not disable cross-stratum hooks
    #[arg(short = 'u', long = "unrestrict")]
    unrestrict: bool,

    /// Make a new mount namespace with the new stratum at the root,
    /// instead of using chroot
    #[arg(short = 'n', long = "namespace")]
    namespace: bool,

    /// Specify arg0
    #[arg(short = 'a', long = "arg0", value_name = "ARG0")]
    arg0: Option<String>,

    /// Stratum or alias to enter
    #[arg(value_name = "STRATUM")]
    stratum: String,

    /// Command and arguments; defaults to $SHELL, then /bin/sh
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn exec_error(file: &str, stratum: &str, errno: Errno) -> ! {
    eprintln!("strat: could not run\n    {file}\nfrom stratum\n    {stratum}");
    match errno {
        Errno::EACCES => eprintln!("due to: permission denied (EACCES)."),
        Errno::ENOENT => eprintln!("due to: unable to find file (ENOENT)."),
        e => eprintln!("due to: execv: {e}"),
    }
    std::process::exit(1);
}

fn main() {
    logging::init_logging("warn");
    let cli = Cli::parse();

    if cli.unrestrict {
        // Overrides both the flag and the per-command default below.
    } else if cli.restrict || cmd_is_restricted(cli.command.first().map(String::as_str)) {
        restrict_env();
    }

    let mode = if cli.namespace {
        RootMode::Namespace
    } else {
        RootMode::Chroot
    };
    if let Err(err) = switch_stratum(&cli.stratum, mode) {
        eprintln!("strat: {err:#}");
        std::process::exit(1);
    }

    if let Some(file) = cli.command.first().cloned() {
        let mut argv = cli.command;
        if let Some(arg0) = cli.arg0 {
            argv[0] = arg0;
        }
        let errno = execv_skip(&file, &argv, CROSS_DIR);
        exec_error(&file, &cli.stratum, errno);
    }

    // No command given.  Try $SHELL stripped to its basename: the same
    // shell may live at different paths in different strata, and a SHELL
    // pointing into the cross mount must not be followed back out of the
    // stratum just entered.
    if let Ok(shell) = std::env::var("SHELL") {
        let basename = shell.rsplit('/').next().unwrap_or(&shell).to_string();
        if !basename.is_empty() {
            execv_skip(&basename, &[basename.clone()], CROSS_DIR);
        }
    }

    let errno = execv_skip("/bin/sh", &["/bin/sh".to_string()], CROSS_DIR);
    exec_error("/bin/sh", &cli.stratum, errno);
}
