//! Dev server detection for the default `npm run dev` command

use std::path::Path;

const VITE_CONFIGS: [&str; 5] = [
    "vite.config.ts",
    "vite.config.js",
    "vite.config.mjs",
    "vite.config.mts",
    "vite.config.cjs",
];

const NEXT_CONFIGS: [&str; 3] = ["next.config.js", "next.config.mjs", "next.config.ts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framework {
    Vite,
    /// Reads `PORT` from the environment, needs no flags
    Next,
    Generic,
}

impl Framework {
    /// Detect the framework from config files in `dir`
    pub fn detect(dir: &Path) -> Self {
        let exists = |names: &[&str]| names.iter().any(|name| dir.join(name).is_file());

        if exists(&VITE_CONFIGS) {
            Framework::Vite
        } else if exists(&NEXT_CONFIGS) {
            Framework::Next
        } else {
            Framework::Generic
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Framework::Vite => "vite",
            Framework::Next => "next",
            Framework::Generic => "generic",
        }
    }

    /// Flags pinning the dev server to `port`
    pub fn args(&self, port: u16) -> Vec<String> {
        match self {
            // --strictPort stops Vite from silently moving to another port
            Framework::Vite => vec![
                "--port".to_string(),
                port.to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--strictPort".to_string(),
            ],
            Framework::Next | Framework::Generic => Vec::new(),
        }
    }
}
