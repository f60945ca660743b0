//! One-shot subcommands that edit the registry file and exit without
//! starting the service.

use anyhow::{bail, Context, Result};
use std::io::Write;
use std::path::Path;

use crate::config::{AppSpec, Registry};
use crate::utils::display_width;

const USAGE: &[(&str, &str)] = &[
    ("list", "list configured apps ([*] = active)"),
    ("add <name> <path> [args...]", "register an app with optional default args"),
    ("remove <name>", "remove an app"),
    ("switch <name>", "make an app the active one"),
    ("info [name]", "show an app's path and args (default: active app)"),
    ("help", "show this help"),
];

/// Run a subcommand if `args[0]` names one. Returns `Ok(false)` when it
/// does not, in which case the caller starts the service and treats all
/// arguments as startup args.
pub fn handle(args: &[String], config_path: &Path) -> Result<bool> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    handle_with(args, config_path, &mut out)
}

pub fn handle_with<W: Write>(args: &[String], config_path: &Path, out: &mut W) -> Result<bool> {
    let Some(verb) = args.first() else {
        return Ok(false);
    };
    let rest = &args[1..];

    match verb.as_str() {
        "list" => {
            let registry = load(config_path)?;
            write_list(&registry, out)?;
        }
        "info" => {
            let registry = load(config_path)?;
            let name = rest.first().map(String::as_str).unwrap_or(&registry.activate);
            let app = match rest.first() {
                Some(name) => registry.get(name),
                None => registry.active(),
            }
            .with_context(|| format!("app '{}' not found", name))?;
            writeln!(out, "name: {}", app.name)?;
            writeln!(out, "path: {}", app.path)?;
            writeln!(out, "args: {}", app.args.join(" "))?;
        }
        "add" => {
            if rest.len() < 2 {
                bail!("usage: add <name> <path> [args...]");
            }
            let mut registry = load_or_empty(config_path)?;
            registry.add(AppSpec {
                name: rest[0].clone(),
                path: rest[1].clone(),
                args: rest[2..].to_vec(),
            })?;
            // 첫 번째 앱은 자동으로 활성화
            if registry.activate.is_empty() {
                registry.activate = rest[0].clone();
            }
            registry.save(config_path)?;
            writeln!(out, "added '{}'", rest[0])?;
        }
        "remove" => {
            let name = rest.first().context("usage: remove <name>")?;
            let mut registry = load(config_path)?;
            registry.remove(name)?;
            registry.save(config_path)?;
            writeln!(out, "removed '{}'", name)?;
        }
        "switch" => {
            let name = rest.first().context("usage: switch <name>")?;
            let mut registry = load(config_path)?;
            registry.set_active(name)?;
            registry.save(config_path)?;
            writeln!(out, "active app is now '{}'", name)?;
        }
        "help" | "-h" | "--help" => write_help(out)?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn load(path: &Path) -> Result<Registry> {
    Registry::load(path).with_context(|| format!("cannot load {}", path.display()))
}

fn load_or_empty(path: &Path) -> Result<Registry> {
    if path.exists() {
        load(path)
    } else {
        Ok(Registry::default())
    }
}

fn write_list<W: Write>(registry: &Registry, out: &mut W) -> Result<()> {
    if registry.apps().is_empty() {
        writeln!(out, "no apps configured")?;
        return Ok(());
    }
    let width = registry
        .apps()
        .iter()
        .map(|a| display_width(&a.name))
        .max()
        .unwrap_or(0);
    for app in registry.apps() {
        let mark = if app.name == registry.activate { "[*]" } else { "[ ]" };
        let pad = " ".repeat(width - display_width(&app.name));
        writeln!(out, "{} {}{}  {}", mark, app.name, pad, app.path)?;
    }
    Ok(())
}

fn write_help<W: Write>(out: &mut W) -> Result<()> {
    writeln!(out, "usage: evs <command> [args...]")?;
    writeln!(out)?;
    writeln!(out, "Without a command the service starts; all arguments are passed to the active app.")?;
    writeln!(out)?;
    writeln!(out, "commands:")?;
    for (cmd, desc) in USAGE {
        writeln!(out, "  {:<30} {}", cmd, desc)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn run(items: &[&str], path: &Path) -> (bool, String) {
        let mut out = Vec::new();
        let handled = handle_with(&args(items), path, &mut out).unwrap();
        (handled, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_add_list_switch_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        run(&["add", "alpha", "/opt/a/app", "--x", "--y"], &path);
        run(&["add", "베타", "/opt/b/app"], &path);

        let (_, listed) = run(&["list"], &path);
        let lines: Vec<&str> = listed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[*] alpha  "));
        // 한글 두 글자 = 폭 4, 'alpha' 폭 5 → 공백 1칸 패딩
        assert!(lines[1].starts_with("[ ] 베타   /opt/b/app"));

        run(&["switch", "베타"], &path);
        let registry = Registry::load(&path).unwrap();
        assert_eq!(registry.activate, "베타");
        assert_eq!(registry.get("alpha").unwrap().args, args(&["--x", "--y"]));

        let (_, info) = run(&["info"], &path);
        assert!(info.contains("path: /opt/b/app"));

        run(&["remove", "alpha"], &path);
        assert_eq!(Registry::load(&path).unwrap().app_order(), vec!["베타"]);
    }

    #[test]
    fn test_errors_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        run(&["add", "alpha", "/opt/a/app"], &path);

        let mut sink = Vec::new();
        assert!(handle_with(&args(&["add", "alpha", "/x"]), &path, &mut sink).is_err());
        assert!(handle_with(&args(&["switch", "nope"]), &path, &mut sink).is_err());
        assert!(handle_with(&args(&["remove"]), &path, &mut sink).is_err());
        assert!(handle_with(&args(&["info", "nope"]), &path, &mut sink).is_err());

        // 활성 앱이 목록에 없으면 인자 없는 info 도 실패
        std::fs::write(&path, "activate = \"ghost\"\n\n[apps.alpha]\npath = \"/opt/a/app\"\n").unwrap();
        let err = handle_with(&args(&["info"]), &path, &mut sink).unwrap_err();
        assert!(err.to_string().contains("'ghost'"));
    }

    #[test]
    fn test_non_commands_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        assert!(!run(&[], &path).0);
        assert!(!run(&["--port", "6666"], &path).0);

        let (handled, help) = run(&["help"], &path);
        assert!(handled);
        assert!(help.contains("switch <name>"));
    }
}
