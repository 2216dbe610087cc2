//! Policy Routing
//!
//! Pins each proxy's egress to its tunnel:
//!
//! ```text
//! egress socket (SO_MARK = port)
//!        │
//!        ▼
//! ip rule: fwmark <port> lookup <base + port>
//!        │
//!        ▼
//! table <base + port>: default dev pppN
//! ```
//!
//! The mark is derived from the SOCKS port, so one port maps to exactly
//! one rule and one table. Nothing here touches the main table.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Output of an external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Failed to run {command}: {error}")]
    Spawn { command: String, error: String },

    #[error("{command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RoutingError>;
}

/// Runs commands with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RoutingError> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RoutingError::Spawn {
                command: render(program, args),
                error: e.to_string(),
            })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Installs, checks and removes per-proxy routing
pub struct PolicyRouter {
    runner: Box<dyn CommandRunner>,
    ip_path: PathBuf,
    table_base: u32,
}

impl PolicyRouter {
    pub fn new(runner: Box<dyn CommandRunner>, ip_path: impl Into<PathBuf>, table_base: u32) -> Self {
        Self {
            runner,
            ip_path: ip_path.into(),
            table_base,
        }
    }

    /// Firewall mark for a proxy port
    pub fn mark(port: u16) -> u32 {
        port as u32
    }

    /// Routing table for a proxy port
    pub fn table(&self, port: u16) -> u32 {
        self.table_base.saturating_add(port as u32)
    }

    /// Install rule and table for `port` through `interface`
    ///
    /// Any existing rule for the mark is removed first, so repeating the
    /// call leaves exactly one rule.
    pub async fn configure(&self, port: u16, interface: &str) -> Result<(), RoutingError> {
        self.delete_rules(port).await;

        let table = self.table(port).to_string();
        let mark = format!("{:#x}", Self::mark(port));

        self.ip(&["rule", "add", "fwmark", &mark, "table", &table]).await?;
        self.ip(&["route", "replace", "default", "dev", interface, "table", &table])
            .await?;

        info!(port, interface, table = %table, "Policy routing configured");
        Ok(())
    }

    /// Check that rule and default route are both in place
    pub async fn verify(&self, port: u16, interface: &str) -> bool {
        let table = self.table(port);
        let wanted_rule = format!("fwmark {:#x} lookup {}", Self::mark(port), table);

        let rules = match self.ip_output(&["rule", "show"]).await {
            Some(out) => out,
            None => return false,
        };
        if !rules.lines().any(|l| l.contains(&wanted_rule)) {
            debug!(port, "Routing rule missing");
            return false;
        }

        let routes = match self.ip_output(&["route", "show", "table", &table.to_string()]).await {
            Some(out) => out,
            None => return false,
        };
        let has_default = routes.lines().any(|line| {
            let words: Vec<&str> = line.split_whitespace().collect();
            words.first() == Some(&"default")
                && words.windows(2).any(|w| w[0] == "dev" && w[1] == interface)
        });
        if !has_default {
            debug!(port, interface, "Default route missing from proxy table");
        }
        has_default
    }

    /// Reinstall if `verify` fails; returns whether anything was changed
    pub async fn repair(&self, port: u16, interface: &str) -> Result<bool, RoutingError> {
        if self.verify(port, interface).await {
            return Ok(false);
        }
        warn!(port, interface, "Repairing policy routing");
        self.configure(port, interface).await?;
        Ok(true)
    }

    /// Best-effort removal of rule and table
    pub async fn remove(&self, port: u16) {
        self.delete_rules(port).await;
        let table = self.table(port).to_string();
        if let Err(e) = self.ip(&["route", "flush", "table", &table]).await {
            debug!(port, error = %e, "Flushing proxy table failed");
        }
    }

    /// Delete every rule carrying the port's mark
    async fn delete_rules(&self, port: u16) {
        let table = self.table(port).to_string();
        let mark = format!("{:#x}", Self::mark(port));
        // `ip rule del` removes one match per call
        for _ in 0..8 {
            if self
                .ip(&["rule", "del", "fwmark", &mark, "table", &table])
                .await
                .is_err()
            {
                break;
            }
        }
    }

    async fn ip(&self, args: &[&str]) -> Result<CommandOutput, RoutingError> {
        let program = self.ip_path.to_string_lossy();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let output = self.runner.run(&program, &args).await?;
        if !output.success {
            return Err(RoutingError::CommandFailed {
                command: render(&program, &args),
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    async fn ip_output(&self, args: &[&str]) -> Option<String> {
        match self.ip(args).await {
            Ok(out) => Some(out.stdout),
            Err(e) => {
                warn!(error = %e, "Routing query failed");
                None
            }
        }
    }
}
