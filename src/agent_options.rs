use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
};
use structopt::{clap::AppSettings, StructOpt};

/// The agent has no command line of its own: it lives inside somebody else's
/// process. Options are read from the whitespace separated
/// `CKPT_AGENT_OPTIONS` environment variable instead.
#[derive(Debug, StructOpt)]
#[structopt(
    name = "ckpt-agent",
    about = "Checkpoint/restart agent for epoll, eventfd, signalfd and inotify descriptors",
    after_help = "Use CKPT_LOG to control logging; e.g. CKPT_LOG=all:warn,registry:debug"
)]
#[structopt(global_settings = &[AppSettings::UnifiedHelpMessage])]
pub struct AgentOptions {
    #[structopt(
        long,
        default_value = "6",
        help = "How many times a restarting process asks for a shared connection's recreation data before giving up."
    )]
    pub ns_retries: u32,

    #[structopt(
        long,
        default_value = "10",
        help = "First wait (in milliseconds) between two namespace queries. Doubles on every retry."
    )]
    pub ns_initial_backoff_ms: u64,

    #[structopt(
        long,
        default_value = "1000",
        help = "Upper bound (in milliseconds) for a single wait between two namespace queries."
    )]
    pub ns_max_backoff_ms: u64,

    /// Directory shared by all processes of a computation through which
    /// restarting processes exchange recreation data. Without it only
    /// processes sharing an address space can see each other's records.
    #[structopt(long, parse(try_from_os_str = parse_dir))]
    pub ns_dir: Option<PathBuf>,

    /// Where to write the connection section of the checkpoint image. Without
    /// it the section is kept in memory and travels with the memory snapshot.
    #[structopt(long, parse(try_from_os_str = parse_dir))]
    pub image_dir: Option<PathBuf>,

    #[structopt(
        long,
        help = "Treat an already tracked descriptor being created again as fatal, even in release builds."
    )]
    pub strict_registry: bool,

    #[structopt(
        long,
        default_value = "12",
        help = "Signal the coordinator stops threads with. A thread that gets it inside an intercepted call raises it again once the call returns."
    )]
    pub ckpt_signal: i32,

    #[structopt(
        long,
        help = "Don't adopt epoll/eventfd/signalfd/inotify descriptors inherited across exec()."
    )]
    pub no_adopt: bool,
}

fn parse_dir(dir: &OsStr) -> Result<PathBuf, OsString> {
    let dir_path = PathBuf::from(dir);
    match dir_path.canonicalize() {
        Err(e) => Err(OsString::from(format!("{:?}: {}", dir_path, e))),
        Ok(canonicalized) if canonicalized.is_dir() => Ok(canonicalized),
        Ok(canonicalized) => Err(OsString::from(format!(
            "{:?} is not a directory",
            canonicalized
        ))),
    }
}

impl AgentOptions {
    /// Never exits the host process: a malformed option string is reported and
    /// the defaults are used instead.
    pub fn from_env_string(options: &str) -> AgentOptions {
        let args = std::iter::once("ckpt-agent").chain(options.split_whitespace());
        match AgentOptions::from_iter_safe(args) {
            Ok(opts) => opts,
            Err(e) => {
                log!(
                    crate::log::LogError,
                    "Ignoring malformed CKPT_AGENT_OPTIONS `{}': {}",
                    options,
                    e.message
                );
                AgentOptions::from_iter_safe(std::iter::once("ckpt-agent"))
                    .unwrap_or_else(|e| fatal!("Default agent options don't parse: {}", e))
            }
        }
    }
}
