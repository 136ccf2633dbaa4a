//! Portable command translation.
//!
//! Commands are authored in a small POSIX-flavored vocabulary and mapped to
//! the host dialect through a fixed table of recognized shapes. Anything the
//! table does not recognize exactly is returned untouched, so the host shell
//! gets a chance to run it natively instead of receiving a half-rewritten
//! command.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::executor::ShellKind;

/// `if <test>; then <body>[; else <body>]; fi`
static CONDITIONAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^if\s+(?P<test>[^;]+?)\s*;\s*then\s+(?P<then>[^;]+?)\s*(?:;\s*else\s+(?P<else>[^;]+?)\s*)?;\s*fi$",
    )
    .unwrap_or_else(|err| unreachable!("conditional pattern is valid: {err}"))
});

/// PowerShell `Verb-Noun` cmdlet at the start of a command.
static CMDLET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z][a-z]+-[A-Z][A-Za-z]*\b")
        .unwrap_or_else(|err| unreachable!("cmdlet pattern is valid: {err}"))
});

/// Characters that make a simple command ambiguous for the table matcher.
const SHELL_METACHARACTERS: &[char] = &[
    '|', '&', ';', '<', '>', '$', '`', '(', ')', '{', '}', '*', '?', '\n',
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathKind {
    File,
    Directory,
}

impl PathKind {
    fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            "-f" => Some(Self::File),
            "-d" => Some(Self::Directory),
            _ => None,
        }
    }

    fn powershell_type(self) -> &'static str {
        match self {
            Self::File => "Leaf",
            Self::Directory => "Container",
        }
    }
}

/// Recognized portable command shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Portable {
    CurrentDir,
    List { hidden: bool, path: Option<String> },
    Exists { kind: PathKind, path: String },
    Read { path: String },
    Head { lines: u64, path: String },
    Tail { lines: u64, path: String },
}

/// Pure translator from portable commands to a target shell dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTranslator {
    target: ShellKind,
}

impl Default for CommandTranslator {
    fn default() -> Self {
        Self::for_host()
    }
}

impl CommandTranslator {
    pub fn new(target: ShellKind) -> Self {
        Self { target }
    }

    pub fn for_host() -> Self {
        Self::new(ShellKind::host())
    }

    pub fn target(&self) -> ShellKind {
        self.target
    }

    /// Translate `command` into the target dialect. Returns the input
    /// borrowed when nothing in the table matched.
    pub fn translate<'a>(&self, command: &'a str) -> Cow<'a, str> {
        let trimmed = command.trim();
        if trimmed.is_empty() || self.target == ShellKind::Unix || is_powershell(trimmed) {
            return Cow::Borrowed(command);
        }

        match self.translate_conditional(trimmed) {
            Some(native) => Cow::Owned(native),
            None => match parse_simple(trimmed) {
                Some(portable) => Cow::Owned(render_statement(&portable)),
                None => Cow::Borrowed(command),
            },
        }
    }

    fn translate_conditional(&self, command: &str) -> Option<String> {
        let captures = CONDITIONAL.captures(command)?;
        let Portable::Exists { kind, path } = parse_simple(captures.name("test")?.as_str())? else {
            return None;
        };

        let then_body = captures.name("then")?.as_str();
        let mut native = format!(
            "if ({}) {{ {} }}",
            test_path(kind, &path),
            self.translate(then_body)
        );
        if let Some(else_body) = captures.name("else") {
            native.push_str(&format!(" else {{ {} }}", self.translate(else_body.as_str())));
        }
        Some(native)
    }
}

fn is_powershell(command: &str) -> bool {
    command.starts_with("if (") || CMDLET.is_match(command)
}

fn parse_simple(command: &str) -> Option<Portable> {
    if command.contains(SHELL_METACHARACTERS) {
        return None;
    }
    let words = shell_words::split(command).ok()?;
    let args: Vec<&str> = words.iter().map(String::as_str).collect();

    match args.as_slice() {
        ["pwd"] => Some(Portable::CurrentDir),
        ["ls"] => Some(Portable::List {
            hidden: false,
            path: None,
        }),
        ["ls", flag] if is_hidden_flag(flag) => Some(Portable::List {
            hidden: true,
            path: None,
        }),
        ["ls", path] if !path.starts_with('-') => Some(Portable::List {
            hidden: false,
            path: Some((*path).to_string()),
        }),
        ["ls", flag, path] if is_hidden_flag(flag) && !path.starts_with('-') => {
            Some(Portable::List {
                hidden: true,
                path: Some((*path).to_string()),
            })
        }
        ["test", flag, path] | ["[", flag, path, "]"] => Some(Portable::Exists {
            kind: PathKind::from_flag(flag)?,
            path: (*path).to_string(),
        }),
        ["cat", path] if !path.starts_with('-') => Some(Portable::Read {
            path: (*path).to_string(),
        }),
        ["head", rest @ ..] => {
            let (lines, path) = line_count_args(rest)?;
            Some(Portable::Head { lines, path })
        }
        ["tail", rest @ ..] => {
            let (lines, path) = line_count_args(rest)?;
            Some(Portable::Tail { lines, path })
        }
        _ => None,
    }
}

fn is_hidden_flag(flag: &str) -> bool {
    matches!(flag, "-a" | "-A" | "-la" | "-al")
}

/// `-n N path` or `-N path`.
fn line_count_args(args: &[&str]) -> Option<(u64, String)> {
    let (count, path) = match args {
        ["-n", count, path] => (*count, *path),
        [flag, path] => (flag.strip_prefix('-')?, *path),
        _ => return None,
    };
    if path.starts_with('-') {
        return None;
    }
    Some((count.parse().ok()?, path.to_string()))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn test_path(kind: PathKind, path: &str) -> String {
    format!(
        "Test-Path -LiteralPath {} -PathType {}",
        quote(path),
        kind.powershell_type()
    )
}

fn render_statement(portable: &Portable) -> String {
    match portable {
        Portable::CurrentDir => "(Get-Location).Path".to_string(),
        Portable::List { hidden, path } => {
            let mut native = String::from("Get-ChildItem -Name");
            if *hidden {
                native.push_str(" -Force");
            }
            if let Some(path) = path {
                native.push_str(" -LiteralPath ");
                native.push_str(&quote(path));
            }
            native
        }
        // Exit status carries the answer, matching `test`.
        Portable::Exists { kind, path } => {
            format!("if ({}) {{ exit 0 }} else {{ exit 1 }}", test_path(*kind, path))
        }
        Portable::Read { path } => format!("Get-Content -LiteralPath {}", quote(path)),
        Portable::Head { lines, path } => {
            format!("Get-Content -LiteralPath {} -TotalCount {lines}", quote(path))
        }
        Portable::Tail { lines, path } => {
            format!("Get-Content -LiteralPath {} -Tail {lines}", quote(path))
        }
    }
}
