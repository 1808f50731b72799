use std::path::PathBuf;

use tracing::{info, warn};

use crate::config::SecurityConfig;

/// Isolation wrapper around job launch. When sandboxing is enabled and the
/// wrapper binary is on PATH, run commands are prefixed with an invocation
/// that cuts network access, gives the job a private /tmp, and caps its
/// address space and lifetime. Without it, jobs launch directly and the
/// supervisor applies an address-space rlimit at spawn instead.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    wrapper: Option<PathBuf>,
}

impl SandboxSpec {
    const WRAPPER_BIN: &'static str = "firejail";

    /// Probe for the wrapper once, at engine construction.
    pub fn detect(security: &SecurityConfig) -> Self {
        if !security.enable_sandbox {
            return Self { wrapper: None };
        }
        match which::which(Self::WRAPPER_BIN) {
            Ok(path) => {
                info!(wrapper = %path.display(), "sandbox wrapper available");
                Self {
                    wrapper: Some(path),
                }
            }
            Err(_) => {
                warn!(
                    "sandbox wrapper '{}' not found, jobs will run with rlimits only",
                    Self::WRAPPER_BIN
                );
                Self { wrapper: None }
            }
        }
    }

    /// Build a spec with an explicit wrapper path (tests, exotic installs).
    pub fn with_wrapper(wrapper: Option<PathBuf>) -> Self {
        Self { wrapper }
    }

    pub fn is_active(&self) -> bool {
        self.wrapper.is_some()
    }

    /// The final shell command line for a job's run step.
    pub fn command_line(
        &self,
        run_command: &str,
        memory_limit_bytes: u64,
        max_runtime_secs: u64,
    ) -> String {
        match &self.wrapper {
            Some(wrapper) => {
                let hours = max_runtime_secs / 3600;
                let minutes = (max_runtime_secs % 3600) / 60;
                let seconds = max_runtime_secs % 60;
                format!(
                    "{} --quiet --noprofile --private-tmp --net=none \
                     --rlimit-as={memory_limit_bytes} --timeout={hours:02}:{minutes:02}:{seconds:02} \
                     -- {run_command}",
                    wrapper.display()
                )
            }
            None => run_command.to_string(),
        }
    }
}
