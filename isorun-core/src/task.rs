//! Tasks, Targets and Arguments
//!
//! A [`Task`] bundles a measurement function with the inert [`Target`]
//! descriptor it runs against and the [`Args`] it is called with. Nothing in a
//! task refers to a live device handle; the worker resolves one itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Device/runtime descriptor such as `llvm` or `opencl -device=kmppa -max_num_threads=16`.
///
/// The first token is the target kind. Following `-key=value` tokens become
/// options; a bare `-flag` is stored with the value `"true"`. Tokens that do
/// not start with `-` are kept verbatim as keys with an empty value so no
/// information is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    raw: String,
    kind: String,
    options: BTreeMap<String, String>,
}

impl Target {
    /// Parse a target descriptor
    pub fn new(descriptor: impl AsRef<str>) -> Self {
        let raw = descriptor.as_ref().trim().to_string();
        let mut tokens = raw.split_whitespace();
        let kind = tokens.next().unwrap_or_default().to_string();

        let mut options = BTreeMap::new();
        for token in tokens {
            match token.strip_prefix('-') {
                Some(option) => match option.split_once('=') {
                    Some((key, value)) => {
                        options.insert(key.to_string(), value.to_string());
                    }
                    None => {
                        options.insert(option.to_string(), "true".to_string());
                    }
                },
                None => {
                    options.insert(token.to_string(), String::new());
                }
            }
        }

        Self { raw, kind, options }
    }

    /// Target kind (first token), e.g. `llvm`, `cuda`, `opencl`
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Value of a `-key=value` option
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// All parsed options
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// The descriptor exactly as given (trimmed)
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Target {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target::new(s))
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::new(s)
    }
}

impl From<String> for Target {
    fn from(s: String) -> Self {
        Target::new(s)
    }
}

/// Positional and keyword arguments passed to a measurement function
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    positional: Vec<Value>,
    keyword: BTreeMap<String, Value>,
}

impl Args {
    /// No arguments
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Positional arguments in order
    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    /// Positional argument at `index`
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Keyword argument by name
    pub fn keyword(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// All keyword arguments
    pub fn keywords(&self) -> &BTreeMap<String, Value> {
        &self.keyword
    }

    /// Whether there are no arguments at all
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// One unit of work: a measurement function, its target and its arguments.
///
/// `function` is called as `function(&context, &args)` inside the worker after
/// the target has been resolved to a context.
pub struct Task<F> {
    /// The measurement function
    pub function: F,
    /// Device descriptor resolved inside the worker
    pub target: Target,
    /// Arguments handed to `function`
    pub args: Args,
}

impl<F> Task<F> {
    /// Create a task
    pub fn new(function: F, target: impl Into<Target>, args: Args) -> Self {
        Self {
            function,
            target: target.into(),
            args,
        }
    }
}

impl<F> fmt::Debug for Task<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("target", &self.target)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}
