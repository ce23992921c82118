//! Policy evaluation for proposed executions.
//!
//! A stateless, side-effect-free check of a payload against the configured
//! blocklists. A denied payload never reaches the sandbox.
//!
//! # Detection gap
//!
//! Import scanning is a best-effort lexical pass over `import` / `from`
//! statements. Dynamically constructed imports (`__import__("x")`,
//! `importlib.import_module(...)`) are NOT caught; this is a documented
//! limitation of static checking, not a contract violation.

use crate::config::GatewayConfig;

// ============================================================================
// Types
// ============================================================================

/// The kind of execution being vetted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecKind {
    /// Python source executed via the configured interpreter.
    Python,
    /// A shell command line.
    Shell,
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

/// Evaluate a proposed execution against the configured blocklists.
///
/// Deterministic and side-effect-free; never partially executes anything.
pub fn evaluate(kind: ExecKind, payload: &str, config: &GatewayConfig) -> Decision {
    match kind {
        ExecKind::Python => {
            let blocked = scan_blocked_imports(payload, &config.blocked_imports);
            if blocked.is_empty() {
                Decision::Allow
            } else {
                Decision::deny(format!("blocked imports detected: {}", blocked.join(", ")))
            }
        }
        ExecKind::Shell => {
            let normalized = normalize_whitespace(payload);
            match config
                .blocked_shell_patterns
                .iter()
                .find(|p| !p.is_empty() && normalized.contains(p.as_str()))
            {
                Some(pattern) => Decision::deny(format!("blocked pattern detected: {pattern}")),
                None => Decision::Allow,
            }
        }
    }
}

/// Collect blocklisted module names imported at the top-level import position.
///
/// Recognizes `import a.b as c, d` and `from a.b import x` forms; the match
/// is against the first dotted segment, case-sensitive. Relative imports
/// (`from .x import y`) reference session-local modules and are skipped.
fn scan_blocked_imports<'a>(source: &str, blocked: &'a [String]) -> Vec<&'a str> {
    let mut found: Vec<&str> = Vec::new();

    for line in source.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("import ") {
            // `import a.b as x, c.d` - one module per comma group.
            for group in rest.split(',') {
                let module = top_level_module(group);
                if let Some(hit) = lookup(blocked, module) {
                    found.push(hit);
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            let module = top_level_module(rest);
            if let Some(hit) = lookup(blocked, module) {
                found.push(hit);
            }
        }
    }

    found.dedup();
    found
}

/// First dotted segment of a module reference (`a.b.c` -> `a`).
fn top_level_module(fragment: &str) -> &str {
    let token = fragment.trim().split_whitespace().next().unwrap_or("");
    token.split('.').next().unwrap_or("")
}

fn lookup<'a>(blocked: &'a [String], module: &str) -> Option<&'a str> {
    if module.is_empty() {
        return None;
    }
    blocked
        .iter()
        .find(|b| b.as_str() == module)
        .map(|b| b.as_str())
}

/// Collapse whitespace runs to single spaces so patterns match regardless of
/// command formatting.
fn normalize_whitespace(command: &str) -> String {
    command.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ============================================================================
// Tests
// ============================================================================
