//! authkeeper — command-line client for the password authority daemon.
//!
//! User-facing subcommands (check, state, set, …) talk to the open
//! endpoints and act on the calling user; administrative subcommands
//! (reset, policy) require access to the restricted sockets.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};

use authkeeper_cli::Client;
use authkeeper_core::protocol::{NO_EXPIRATION, policy_flag};
use authkeeper_core::{PasswordKind, PolicyUpdate, StatusCode};

/// Command-line client for the authkeeper daemon.
#[derive(Parser, Debug)]
#[command(name = "authkeeper", version, about, long_about = None)]
struct Cli {
    /// Directory holding the daemon's endpoint sockets.
    #[arg(long, default_value = "/run/authkeeper")]
    runtime_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a password for the calling user.
    Check {
        #[arg(long, value_enum, default_value_t = KindArg::Normal)]
        kind: KindArg,
        /// The password to verify.
        password: String,
    },
    /// Show the password state without spending an attempt.
    State {
        #[arg(long, value_enum, default_value_t = KindArg::Normal)]
        kind: KindArg,
    },
    /// Ask whether a candidate password was used recently.
    Reused {
        /// The candidate password.
        password: String,
    },
    /// Rotate a password for the calling user.
    Set {
        #[arg(long, value_enum, default_value_t = KindArg::Normal)]
        kind: KindArg,
        /// The current password (empty string when none is set).
        current: String,
        /// The new password (empty string removes it).
        new: String,
    },
    /// Rewrite the normal password using the recovery password.
    SetRecovery {
        /// The current recovery password.
        recovery: String,
        /// The new normal password.
        new: String,
    },
    /// Administrative reset of any user's password.
    Reset {
        #[arg(long, value_enum, default_value_t = KindArg::Normal)]
        kind: KindArg,
        /// Target user ID.
        #[arg(long)]
        uid: u32,
        /// The new password (empty string removes it).
        new: String,
    },
    /// Manage per-user password policies.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Subcommand, Debug)]
enum PolicyCommand {
    /// Install or update policy fields; only supplied flags are changed.
    Set(PolicySetArgs),
    /// Disable and clear a user's policy.
    Disable {
        /// Target user ID.
        #[arg(long)]
        uid: u32,
    },
}

#[derive(Args, Debug)]
struct PolicySetArgs {
    /// Target user ID.
    #[arg(long)]
    uid: u32,

    /// Lockout threshold (0 disables the lockout).
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Expiration period in days (0 disables expiry).
    #[arg(long)]
    valid_days: Option<u32>,

    /// Reuse-history size (0 disables history).
    #[arg(long)]
    history: Option<u32>,

    /// Minimum password length.
    #[arg(long)]
    min_length: Option<u32>,

    /// Minimum count of non-alphabetic characters.
    #[arg(long)]
    min_complex_chars: Option<u32>,

    /// Maximum occurrences of any single character.
    #[arg(long)]
    max_char_occurrences: Option<u32>,

    /// Maximum run of consecutive or identical digits.
    #[arg(long)]
    max_num_seq_length: Option<u32>,

    /// Required quality class.
    #[arg(long, value_enum)]
    quality: Option<QualityArg>,

    /// Pattern the password must match (POSIX extended syntax).
    #[arg(long)]
    pattern: Option<String>,

    /// Forbidden password; repeatable. An empty value clears the stored
    /// set.
    #[arg(long = "forbidden")]
    forbidden: Vec<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum KindArg {
    Normal,
    Recovery,
}

impl From<KindArg> for PasswordKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Normal => Self::Normal,
            KindArg::Recovery => Self::Recovery,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum QualityArg {
    Unspecified,
    Something,
    Numeric,
    Alphabetic,
    Alphanumeric,
}

impl QualityArg {
    const fn code(self) -> u32 {
        match self {
            Self::Unspecified => 0,
            Self::Something => 1,
            Self::Numeric => 2,
            Self::Alphabetic => 3,
            Self::Alphanumeric => 4,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("authkeeper: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new(&cli.runtime_dir);

    match cli.command {
        Command::Check { kind, password } => {
            let report = client
                .check_password(kind.into(), &password)
                .context("check failed")?;
            print_counters(report.counters);
            expect_success(report.status)
        }
        Command::State { kind } => {
            let report = client.check_state(kind.into()).context("state failed")?;
            print_counters(report.counters);
            expect_success(report.status)
        }
        Command::Reused { password } => {
            let (status, reused) = client
                .check_reused(PasswordKind::Normal, &password)
                .context("reused query failed")?;
            expect_success(status)?;
            println!("reused: {}", if reused == Some(true) { "yes" } else { "no" });
            Ok(())
        }
        Command::Set { kind, current, new } => {
            let status = client
                .set_password(kind.into(), &current, &new)
                .context("set failed")?;
            expect_success(status)
        }
        Command::SetRecovery { recovery, new } => {
            let status = client
                .set_password_recovery(&recovery, &new)
                .context("set-recovery failed")?;
            expect_success(status)
        }
        Command::Reset { kind, uid, new } => {
            let status = client
                .reset_password(kind.into(), &new, uid)
                .context("reset failed")?;
            expect_success(status)
        }
        Command::Policy { command } => match command {
            PolicyCommand::Set(args) => {
                let update = build_policy_update(args)?;
                let status = client.set_policy(&update).context("policy set failed")?;
                expect_success(status)
            }
            PolicyCommand::Disable { uid } => {
                let status = client.disable_policy(uid).context("policy disable failed")?;
                expect_success(status)
            }
        },
    }
}

fn build_policy_update(args: PolicySetArgs) -> Result<PolicyUpdate> {
    let mut update = PolicyUpdate {
        uid: args.uid,
        ..PolicyUpdate::default()
    };

    if let Some(value) = args.max_attempts {
        update.set_flag(policy_flag::MAX_ATTEMPTS);
        update.max_attempts = value;
    }
    if let Some(value) = args.valid_days {
        update.set_flag(policy_flag::VALID_PERIOD);
        update.valid_days = value;
    }
    if let Some(value) = args.history {
        update.set_flag(policy_flag::HISTORY_SIZE);
        update.history_size = value;
    }
    if let Some(value) = args.min_length {
        update.set_flag(policy_flag::MIN_LENGTH);
        update.min_length = value;
    }
    if let Some(value) = args.min_complex_chars {
        update.set_flag(policy_flag::MIN_COMPLEX_CHARS);
        update.min_complex_chars = value;
    }
    if let Some(value) = args.max_char_occurrences {
        update.set_flag(policy_flag::MAX_CHAR_OCCURRENCES);
        update.max_char_occurrences = value;
    }
    if let Some(value) = args.max_num_seq_length {
        update.set_flag(policy_flag::MAX_NUM_SEQ_LENGTH);
        update.max_num_seq_length = value;
    }
    if let Some(quality) = args.quality {
        update.set_flag(policy_flag::QUALITY_TYPE);
        update.quality = quality.code();
    }
    if let Some(pattern) = args.pattern {
        update.set_flag(policy_flag::PATTERN);
        update.pattern = pattern;
    }
    if !args.forbidden.is_empty() {
        update.set_flag(policy_flag::FORBIDDEN_PASSWORDS);
        update.forbidden = args.forbidden;
    }

    if update.flags == 0 {
        bail!("policy set requires at least one field");
    }
    Ok(update)
}

fn print_counters(counters: Option<(u32, u32, u32)>) {
    if let Some((attempt, max_attempt, seconds_left)) = counters {
        println!("attempt:      {attempt}");
        if max_attempt == 0 {
            println!("max attempts: unlimited");
        } else {
            println!("max attempts: {max_attempt}");
        }
        if seconds_left == NO_EXPIRATION {
            println!("expires in:   never");
        } else {
            println!("expires in:   {seconds_left}s");
        }
    }
}

fn expect_success(status: StatusCode) -> Result<()> {
    if status.is_success() {
        println!("ok");
        Ok(())
    } else {
        bail!("{status}")
    }
}
