use crate::{agent_options::AgentOptions, namespace::RetryPolicy};
use std::{env, path::PathBuf, time::Duration};

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

#[derive(Clone, Debug)]
pub struct Flags {
    /// Bounds for the restart-time namespace queries.
    pub ns_retry_policy: RetryPolicy,
    /// Directory used as the cross-process namespace transport.
    pub ns_dir: Option<PathBuf>,
    /// Directory for the persisted connection records.
    pub image_dir: Option<PathBuf>,
    /// Reject (instead of overwrite) a descriptor that is tracked twice.
    /// Always on in debug builds.
    pub strict_registry: bool,
    /// Track supported descriptors that were inherited across exec().
    pub adopt_inherited: bool,
    /// Raised again on a thread whose suspension was deferred.
    pub ckpt_signal: i32,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

pub fn init_flags() -> Flags {
    let options = AgentOptions::from_env_string(
        &env::var("CKPT_AGENT_OPTIONS").unwrap_or_else(|_| String::new()),
    );
    Flags::from_options(options)
}

impl Flags {
    pub fn from_options(options: AgentOptions) -> Flags {
        Flags {
            ns_retry_policy: RetryPolicy {
                max_attempts: options.ns_retries.max(1),
                initial_backoff: Duration::from_millis(options.ns_initial_backoff_ms),
                max_backoff: Duration::from_millis(options.ns_max_backoff_ms),
            },
            ns_dir: options.ns_dir,
            image_dir: options.image_dir,
            strict_registry: options.strict_registry || cfg!(debug_assertions),
            adopt_inherited: !options.no_adopt,
            ckpt_signal: options.ckpt_signal,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_retries_still_asks_once() {
        let flags = Flags::from_options(AgentOptions::from_env_string("--ns-retries 0"));
        assert_eq!(1, flags.ns_retry_policy.max_attempts);
        assert!(flags.adopt_inherited);
    }
}
