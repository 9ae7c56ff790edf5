//! Capability probing across runtime builds.
//!
//! Different controller runtime builds expose the same action under
//! different operation names. [`CapabilityProbe::resolve`] walks a declared,
//! ordered candidate list and settles on the first combination that works,
//! so earlier candidates always win.

use std::fmt;

use tracing::{debug, warn};

use crate::device::{ops, options, OnlineApplication};
use crate::error::CapabilityError;
use crate::obs;

/// Candidates for pulling the source of truth from the device.
pub const SOURCE_PULL: &[&str] = &[ops::SOURCE_DOWNLOAD, ops::SOURCE_UPLOAD];

/// Candidates for applying the repository program to the device.
pub const APPLY: &[&str] = &[
    ops::DOWNLOAD,
    ops::APPLICATION_DOWNLOAD,
    ops::PROGRAM_DOWNLOAD,
    ops::CREATE_BOOT_APPLICATION,
];

/// Option names tried with each [`APPLY`] candidate, in order.
pub const APPLY_OPTIONS: &[&str] = &[
    options::DOWNLOAD,
    options::FULL_DOWNLOAD,
    options::ALL,
    options::KEEP,
];

/// The operation/option pair that succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOperation {
    pub operation: String,
    pub option: Option<String>,
}

impl ResolvedOperation {
    /// `"<operation>(<option>)"`, or `"<operation>()"` without an option.
    pub fn descriptor(&self) -> String {
        format!("{}({})", self.operation, self.option.as_deref().unwrap_or(""))
    }
}

impl fmt::Display for ResolvedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.descriptor())
    }
}

/// Resolves an action against whatever the session actually supports.
pub struct CapabilityProbe;

impl CapabilityProbe {
    /// Invoke the first working candidate.
    ///
    /// For each operation the session exposes, each option the runtime
    /// offers is tried in order, then the operation with no option. The
    /// first call that succeeds is the result. Fails with the last error
    /// observed when nothing works.
    pub async fn resolve(
        session: &dyn OnlineApplication,
        operations: &[&str],
        candidate_options: &[&str],
    ) -> Result<ResolvedOperation, CapabilityError> {
        let caps = session.capabilities();
        let mut last_error = String::from("no candidate operation is exposed");

        for &operation in operations {
            if !caps.exposes(operation) {
                debug!(operation = %operation, "not exposed");
                continue;
            }

            for &option in candidate_options {
                if !caps.has_option(option) {
                    continue;
                }
                match session.invoke(operation, Some(option)).await {
                    Ok(()) => {
                        return Ok(Self::resolved(operation, Some(option)));
                    }
                    Err(e) => {
                        warn!(operation = %operation, option = %option, error = %e, "candidate failed");
                        last_error = e.to_string();
                    }
                }
            }

            match session.invoke(operation, None).await {
                Ok(()) => return Ok(Self::resolved(operation, None)),
                Err(e) => {
                    warn!(operation = %operation, error = %e, "candidate failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(CapabilityError::NoMatchingOperation {
            candidates: operations.join(", "),
            last_error,
        })
    }

    /// Whether the session exposes any of `operations`.
    pub fn exposes_any(session: &dyn OnlineApplication, operations: &[&str]) -> bool {
        let caps = session.capabilities();
        operations.iter().any(|op| caps.exposes(op))
    }

    fn resolved(operation: &str, option: Option<&str>) -> ResolvedOperation {
        let resolved = ResolvedOperation {
            operation: operation.to_string(),
            option: option.map(str::to_string),
        };
        obs::emit_probe_resolved(&resolved.descriptor());
        resolved
    }
}
