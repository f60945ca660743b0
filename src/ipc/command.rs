//! Control protocol request parsing.
//!
//! A request is one line: a verb, optionally followed by an argument
//! either after `:` (`switch:B`) or after a space (`switch B`). Verbs are
//! case-insensitive; arguments are taken verbatim.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Activate,
    List,
    /// legacy alias of `list`
    AppOrder,
    Info(Option<String>),
    /// legacy: `path|||args` of the active app
    GetAppInfo,
    Run(Vec<String>),
    Switch(Option<String>),
    Restart,
    Stop,
    Reload,
    Exit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let (verb, arg) = match line.find([':', ' ']) {
            Some(i) => (&line[..i], line[i + 1..].trim()),
            None => (line, ""),
        };
        let arg = (!arg.is_empty()).then(|| arg.to_string());

        match verb.to_ascii_lowercase().as_str() {
            "status" => Self::Status,
            "activate" => Self::Activate,
            "list" => Self::List,
            "apporder" => Self::AppOrder,
            "info" => Self::Info(arg),
            "getappinfo" => Self::GetAppInfo,
            "run" => Self::Run(
                arg.as_deref()
                    .map(|a| a.split_whitespace().map(str::to_string).collect())
                    .unwrap_or_default(),
            ),
            "switch" => Self::Switch(arg),
            "restart" => Self::Restart,
            "stop" => Self::Stop,
            "reload" => Self::Reload,
            "exit" => Self::Exit,
            _ => Self::Unknown(verb.to_string()),
        }
    }

    /// Verb name for logging.
    pub fn verb(&self) -> &str {
        match self {
            Self::Status => "status",
            Self::Activate => "activate",
            Self::List => "list",
            Self::AppOrder => "apporder",
            Self::Info(_) => "info",
            Self::GetAppInfo => "getappinfo",
            Self::Run(_) => "run",
            Self::Switch(_) => "switch",
            Self::Restart => "restart",
            Self::Stop => "stop",
            Self::Reload => "reload",
            Self::Exit => "exit",
            Self::Empty => "",
            Self::Unknown(v) => v,
        }
    }
}
