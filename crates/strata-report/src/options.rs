#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorChoice {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOptions {
    pub color: ColorChoice,
    /// Also list unchanged nodes, change ordering and status transitions.
    pub verbose: bool,
    /// Subcommand shown in the header; `plan` or `apply` when unset.
    pub command: Option<String>,
    /// Configuration source shown after the command.
    pub target: Option<String>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            color: ColorChoice::Auto,
            verbose: false,
            command: None,
            target: None,
        }
    }
}
