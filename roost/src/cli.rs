//! CLI-only subcommand implementations: `check`.
//!
//! These run without starting the daemon and are useful for validating
//! the host environment before `serve`.

use std::path::PathBuf;

use anyhow::Result;

use crate::config::Config;

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `roost check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let mut checks: Vec<Check> = Vec::new();

    checks.push(check_socket_dir(config));
    checks.push(check_config(config));
    checks.push(check_sandbox(config));
    if config.tunnel.auto_connect {
        checks.push(check_relay_proxy(config));
    }

    let mut failures = 0;
    for check in &checks {
        let mark = if check.ok { "ok" } else { "FAIL" };
        println!("  [{mark}] {}: {}", check.label, check.detail);
        if let Some(fix) = &check.fix {
            println!("         fix: {fix}");
        }
        if !check.ok {
            failures += 1;
        }
    }

    println!();
    if failures == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{failures} check(s) failed");
    }
}

fn check_socket_dir(config: &Config) -> Check {
    let dir = config
        .server
        .socket_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    if dir.exists() {
        Check::pass("socket directory", dir.display().to_string())
    } else {
        Check::fail(
            "socket directory",
            format!("{} does not exist", dir.display()),
            format!("mkdir -p {}", dir.display()),
        )
    }
}

fn check_config(config: &Config) -> Check {
    match config.validate() {
        Ok(()) => Check::pass("configuration", "values within limits"),
        Err(e) => Check::fail("configuration", e.to_string(), "edit the config file"),
    }
}

fn check_sandbox(config: &Config) -> Check {
    match (&config.sandbox.sandbox_command, config.sandbox.enable_sandboxing) {
        (Some(command), true) => {
            if which(command) {
                Check::pass("sandbox wrapper", command.clone())
            } else {
                Check::fail(
                    "sandbox wrapper",
                    format!("{command} not found"),
                    "install it or unset sandbox.sandbox_command",
                )
            }
        }
        _ => Check::pass("sandbox wrapper", "not configured"),
    }
}

fn check_relay_proxy(config: &Config) -> Check {
    if which(&config.tunnel.proxy_command) {
        Check::pass("relay proxy", config.tunnel.proxy_command.clone())
    } else {
        Check::fail(
            "relay proxy",
            format!("{} not found", config.tunnel.proxy_command),
            "install the relay proxy or disable tunnel.auto_connect",
        )
    }
}

/// Is `command` an existing path or findable in PATH?
fn which(command: &str) -> bool {
    if command.contains('/') {
        return PathBuf::from(command).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(command).exists()))
        .unwrap_or(false)
}
