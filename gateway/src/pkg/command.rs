//! Command mapping — logical operation to per-manager argv
//!
//! Pure functions, no I/O. Every match over `ManagerIdentity` is exhaustive
//! so a new manager cannot be added without deciding its spelling here.

use crate::error::{GatewayError, Result};
use crate::pkg::{LogicalOperation, ManagerIdentity, OperationFlags};

/// Which spelling of a reporting command to emit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Machine-readable (`--json`, `--format json`)
    #[default]
    Json,
    /// The manager's plain text report
    Text,
}

/// What to run for an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandPlan {
    /// argv, executable first
    Run(Vec<String>),
    /// The manager has no equivalent of the requested operation
    Unsupported {
        manager: ManagerIdentity,
        operation: LogicalOperation,
        reason: String,
    },
}

impl CommandPlan {
    pub fn argv(&self) -> Option<&[String]> {
        match self {
            Self::Run(argv) => Some(argv),
            Self::Unsupported { .. } => None,
        }
    }
}

struct Argv(Vec<String>);

impl Argv {
    fn new(manager: ManagerIdentity) -> Self {
        Self(vec![manager.executable().to_string()])
    }

    fn push(&mut self, parts: &[&str]) -> &mut Self {
        self.0.extend(parts.iter().map(|s| s.to_string()));
        self
    }

    fn push_if(&mut self, cond: bool, parts: &[&str]) -> &mut Self {
        if cond {
            self.push(parts);
        }
        self
    }

    fn packages(&mut self, packages: &[String]) -> &mut Self {
        self.0.extend(packages.iter().cloned());
        self
    }

    fn plan(&mut self) -> CommandPlan {
        CommandPlan::Run(std::mem::take(&mut self.0))
    }
}

/// Map an operation to the argv for `manager`.
///
/// Empty `packages` on install/update means "everything declared". Remove
/// without packages is a caller error.
pub fn build_command(
    operation: LogicalOperation,
    manager: ManagerIdentity,
    flags: &OperationFlags,
    packages: &[String],
    format: OutputFormat,
) -> Result<CommandPlan> {
    use ManagerIdentity::*;

    let json = format == OutputFormat::Json;
    let mut argv = Argv::new(manager);

    let plan = match operation {
        LogicalOperation::Install if packages.is_empty() => match manager {
            Npm => argv
                .push(&["install"])
                .push_if(flags.production, &["--omit=dev"])
                .push_if(flags.global, &["--global"])
                .push_if(flags.force, &["--force"])
                .plan(),
            Yarn => argv
                .push(&["install"])
                .push_if(flags.production, &["--production"])
                .push_if(flags.force, &["--force"])
                .plan(),
            Pnpm => argv
                .push(&["install"])
                .push_if(flags.production, &["--prod"])
                .push_if(flags.force, &["--force"])
                .plan(),
        },

        LogicalOperation::Install => match manager {
            Npm => argv
                .push(&["install"])
                .push_if(flags.dev, &["--save-dev"])
                .push_if(flags.global, &["--global"])
                .push_if(flags.force, &["--force"])
                .packages(packages)
                .plan(),
            Yarn => argv
                .push_if(flags.global, &["global"])
                .push(&["add"])
                .push_if(flags.dev, &["--dev"])
                .push_if(flags.force, &["--force"])
                .packages(packages)
                .plan(),
            Pnpm => argv
                .push(&["add"])
                .push_if(flags.dev, &["--save-dev"])
                .push_if(flags.global, &["--global"])
                .push_if(flags.force, &["--force"])
                .packages(packages)
                .plan(),
        },

        LogicalOperation::Update => match manager {
            Npm => argv
                .push(&["update"])
                .push_if(flags.global, &["--global"])
                .packages(packages)
                .plan(),
            Yarn => argv
                .push_if(flags.global, &["global"])
                .push(&["upgrade"])
                .packages(packages)
                .plan(),
            Pnpm => argv
                .push(&["update"])
                .push_if(flags.global, &["--global"])
                .packages(packages)
                .plan(),
        },

        LogicalOperation::Remove => {
            if packages.is_empty() {
                return Err(GatewayError::MissingPackages(operation));
            }
            match manager {
                Npm => argv
                    .push(&["uninstall"])
                    .push_if(flags.global, &["--global"])
                    .packages(packages)
                    .plan(),
                Yarn => argv
                    .push_if(flags.global, &["global"])
                    .push(&["remove"])
                    .packages(packages)
                    .plan(),
                Pnpm => argv
                    .push(&["remove"])
                    .push_if(flags.global, &["--global"])
                    .packages(packages)
                    .plan(),
            }
        }

        LogicalOperation::Audit if flags.fix => match manager {
            Npm => argv
                .push(&["audit", "fix"])
                .push_if(flags.force, &["--force"])
                .push_if(flags.production, &["--omit=dev"])
                .plan(),
            Yarn => CommandPlan::Unsupported {
                manager,
                operation,
                reason: "yarn audit cannot apply fixes; upgrade the affected packages instead"
                    .to_string(),
            },
            Pnpm => argv
                .push(&["audit", "--fix"])
                .push_if(flags.production, &["--prod"])
                .plan(),
        },

        LogicalOperation::Audit => match manager {
            Npm => argv
                .push(&["audit"])
                .push_if(flags.production, &["--omit=dev"])
                .push_if(json, &["--json"])
                .plan(),
            Yarn => argv
                .push(&["audit"])
                .push_if(flags.production, &["--groups", "dependencies"])
                .push_if(json, &["--json"])
                .plan(),
            Pnpm => argv
                .push(&["audit"])
                .push_if(flags.production, &["--prod"])
                .push_if(json, &["--json"])
                .plan(),
        },

        LogicalOperation::Outdated => match manager {
            Npm => argv
                .push(&["outdated"])
                .push_if(flags.global, &["--global"])
                .push_if(json, &["--json"])
                .packages(packages)
                .plan(),
            Yarn => argv
                .push(&["outdated"])
                .push_if(json, &["--json"])
                .packages(packages)
                .plan(),
            Pnpm => argv
                .push(&["outdated"])
                .push_if(flags.global, &["--global"])
                .push_if(json, &["--format", "json"])
                .packages(packages)
                .plan(),
        },

        LogicalOperation::CleanCache => argv.push(clean_cache_args(manager)).plan(),
    };

    Ok(plan)
}

fn clean_cache_args(manager: ManagerIdentity) -> &'static [&'static str] {
    match manager {
        ManagerIdentity::Npm => &["cache", "clean", "--force"],
        ManagerIdentity::Yarn => &["cache", "clean"],
        ManagerIdentity::Pnpm => &["store", "prune"],
    }
}

/// Command that clears the manager's local cache/store; run between
/// attempts when a stale tracker blocks an operation.
pub fn recovery_command(manager: ManagerIdentity) -> Vec<String> {
    let mut argv = Argv::new(manager);
    argv.push(clean_cache_args(manager));
    argv.0
}

/// `<manager> --version`
pub fn version_command(manager: ManagerIdentity) -> Vec<String> {
    vec![manager.executable().to_string(), "--version".to_string()]
}
