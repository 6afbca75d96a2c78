//! Command line parsing
//!
//! `portlens [NAME] [COMMAND ARGS...]`. The first word that does not start
//! with `-` names the project; everything after it is the wrapped command.

/// What the user asked portlens to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Project name overriding config discovery
    pub name: Option<String>,
    /// Wrapped command; empty means the framework default
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Run(Invocation),
    Doctor,
    Help,
    Version,
}

impl CliCommand {
    /// Parse arguments, excluding the program name
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        match args.first().map(String::as_str) {
            Some("doctor") => return CliCommand::Doctor,
            Some("-h") | Some("--help") => return CliCommand::Help,
            Some("-V") | Some("--version") => return CliCommand::Version,
            _ => {}
        }

        let invocation = match args.split_first() {
            Some((first, rest)) if !first.starts_with('-') => Invocation {
                name: Some(first.clone()),
                command: rest.to_vec(),
            },
            _ => Invocation {
                name: None,
                command: Vec::new(),
            },
        };
        CliCommand::Run(invocation)
    }
}

pub fn usage() -> String {
    format!(
        "portlens {}

Run a dev server behind a stable local domain.

USAGE:
    portlens [NAME] [COMMAND ARGS...]
    portlens doctor

ARGS:
    NAME       Project name, e.g. `shop` for http://shop.localhost
    COMMAND    Command to run instead of `npm run dev`

OPTIONS:
    -h, --help       Print help
    -V, --version    Print version

ENVIRONMENT:
    PORTLENS_PROXY_PORT    Public proxy port (default: 80)
    RUST_LOG               Log filter, e.g. portlens=debug",
        crate::VERSION
    )
}
