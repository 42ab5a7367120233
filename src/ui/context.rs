//! Interactive vs. piped output detection

use std::io::IsTerminal;

/// Set in every pod, so a node agent running in-cluster never gets styling
const PLAIN_OUTPUT_VARS: [&str; 4] = ["KUBERNETES_SERVICE_HOST", "CI", "GITHUB_ACTIONS", "GITLAB_CI"];

#[derive(Debug, Clone)]
pub struct UiContext {
    fancy: bool,
}

impl UiContext {
    pub fn detect() -> Self {
        Self::from_environment(std::io::stdout().is_terminal(), |var| {
            std::env::var_os(var).is_some()
        })
    }

    pub fn non_interactive() -> Self {
        Self { fancy: false }
    }

    fn from_environment(stdout_is_tty: bool, is_set: impl Fn(&str) -> bool) -> Self {
        Self {
            fancy: stdout_is_tty && !PLAIN_OUTPUT_VARS.iter().any(|var| is_set(var)),
        }
    }

    pub fn use_fancy_output(&self) -> bool {
        self.fancy
    }
}
