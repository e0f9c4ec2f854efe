use std::sync::Arc;

use anyhow::Result;
use regex::Regex;
use tracing::{debug, info};

use common::{Code, Slot, ValidationResult};

use crate::sandbox::{Sandbox, SandboxRunner};

/// The function each code slot has to define.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    pub name: &'static str,
    pub arity: usize,

    /// Shown to the user when the header does not match.
    pub message: &'static str,
}

impl Signature {
    pub const fn of(slot: Slot) -> Self {
        match slot {
            Slot::Map => Signature {
                name: "fmap",
                arity: 1,
                message: "The function must be named 'fmap' and take one argument (value)",
            },
            Slot::Combiner => Signature {
                name: "fcomb",
                arity: 2,
                message: "The function must be named 'fcomb' and take two arguments (key, values)",
            },
            Slot::Reduce => Signature {
                name: "fred",
                arity: 2,
                message: "The function must be named 'fred' and take two arguments (key, values)",
            },
        }
    }
}

/// Build the pattern matching `def <name>(<arity> args):` at the start of
/// the code.
fn header_pattern(name: &str, arity: usize) -> Result<Regex> {
    let arg = r"\s*\w+\s*";
    let args = match arity {
        0 => String::new(),
        n => format!("{arg}{}", format!(",{arg}").repeat(n - 1)),
    };

    let pattern = format!(r"^\s*def\s+{}\(\s*{args}\s*\)\s*:", regex::escape(name));
    Ok(Regex::new(&pattern)?)
}

/// Whether `code` starts by defining `name` with exactly `arity` arguments.
///
/// Only the header is looked at; whatever follows it is irrelevant.
pub fn is_valid_function_header(code: &str, name: &str, arity: usize) -> Result<bool> {
    Ok(header_pattern(name, arity)?.is_match(code))
}

/// Checks user code before it runs against real data.
///
/// Each slot first has its header checked; only a well-formed slot is then
/// executed once in the sandbox, and the message of any exception it raises
/// becomes the slot's error. Slots run one after another so that one
/// slot's run cannot clobber another's captured error.
pub struct CodeValidator<S> {
    runner: Arc<SandboxRunner<S>>,
    headers: Vec<(Slot, Signature, Regex)>,
}

impl<S: Sandbox> CodeValidator<S> {
    pub fn new(runner: Arc<SandboxRunner<S>>) -> Result<Self> {
        let headers = Slot::ALL
            .iter()
            .map(|slot| {
                let signature = Signature::of(*slot);
                let pattern = header_pattern(signature.name, signature.arity)?;
                Ok((*slot, signature, pattern))
            })
            .collect::<Result<_>>()?;

        Ok(Self { runner, headers })
    }

    pub async fn validate(&self, code: &Code) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        for (slot, signature, pattern) in &self.headers {
            let source = code.slot(*slot);

            if *slot == Slot::Combiner && source.is_empty() {
                debug!("no combiner submitted, skipping");
                continue;
            }

            if !pattern.is_match(source) {
                info!("{slot} code does not define {}", signature.name);
                result.set_slot(*slot, signature.message);
                continue;
            }

            let error = self.runner.run_validation(source).await?;
            if !error.is_empty() {
                info!("{slot} code raised: {error}");
            }
            result.set_slot(*slot, error);
        }

        Ok(result)
    }
}
