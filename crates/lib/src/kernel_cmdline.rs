//! Kernel command line parsing and assembly.
//!
//! [`Cmdline`] parses raw kernel arguments, supporting both key-only switches
//! and key-value pairs with quote handling. [`KernelCmdline`] is the owned,
//! ordered parameter list the installer builds up from the platform, board,
//! default and user-supplied sources.

use std::borrow::Cow;
use std::fmt::Display;

use anyhow::{Context, Result};

/// Arguments appended to every installed kernel command line.
pub(crate) const DEFAULT_ARGS: &[&str] = &[
    "init_on_alloc=1",
    "slab_nomerge",
    "pti=on",
    "consoleblank=0",
    // AWS recommends setting the nvme_core.io_timeout to the highest value possible.
    "nvme_core.io_timeout=4294967295",
    // Disable rate limiting for /dev/kmsg writes from userspace.
    "printk.devkmsg=on",
    "ima_template=ima-ng",
    "ima_appraise=fix",
    "ima_hash=sha512",
];

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes and provides methods for iterating
/// over individual parameters.
pub(crate) struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Reads the kernel command line of the running system from `/proc/cmdline`.
    pub fn from_proc() -> Result<Self> {
        let contents = std::fs::read("/proc/cmdline").context("Reading /proc/cmdline")?;
        Ok(Self(Cow::Owned(contents)))
    }

    /// Returns an iterator over all parameters in the command line.
    ///
    /// Splits on unquoted whitespace; quoted values may contain whitespace.
    pub fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;

        self.0
            .split(move |c| {
                if *c == b'"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::from)
    }

    /// Locate a kernel argument with the given key name.
    ///
    /// Key comparison treats dashes and underscores as equivalent.
    pub fn find(&'a self, key: impl AsRef<[u8]>) -> Option<Parameter<'a>> {
        let key = ParameterKey(key.as_ref());
        self.iter().find(|p| p.key == key)
    }
}

/// A single kernel command line parameter key.
///
/// Dashes and underscores in keys are equivalent.
#[derive(Debug, Eq)]
pub(crate) struct ParameterKey<'a>(&'a [u8]);

impl PartialEq for ParameterKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        let dedashed = |&c: &u8| if c == b'-' { b'_' } else { c };

        // We can't just zip() because leading substrings will match
        let our_iter = self.0.iter().map(dedashed);
        let other_iter = other.0.iter().map(dedashed);
        our_iter.eq(other_iter)
    }
}

/// A single kernel command line parameter.
#[derive(Debug, Eq)]
pub(crate) struct Parameter<'a> {
    /// The parameter key as raw bytes
    pub key: ParameterKey<'a>,
    /// The parameter value as raw bytes, if present
    pub value: Option<&'a [u8]>,
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    /// Splits on the first `=`; only the outermost pair of double quotes is
    /// stripped from the value.
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        match input.iter().position(|b| *b == b'=') {
            None => Self {
                key: ParameterKey(input),
                value: None,
            },
            Some(i) => {
                let (key, value) = input.split_at(i);
                let value = &value[1..];
                let value = value
                    .strip_prefix(b"\"")
                    .unwrap_or(value)
                    .strip_suffix(b"\"")
                    .unwrap_or(value);
                Self {
                    key: ParameterKey(key),
                    value: Some(value),
                }
            }
        }
    }
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl<'a> Parameter<'a> {
    fn key_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.key.0).context("Kernel argument key is not UTF-8")
    }

    pub(crate) fn value_str(&self) -> Result<Option<&'a str>> {
        self.value
            .map(std::str::from_utf8)
            .transpose()
            .context("Kernel argument value is not UTF-8")
    }
}

/// One key of a [`KernelCmdline`] with all of its values, in order.
///
/// A value of `None` is a bare switch such as `slab_nomerge`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelParam {
    key: String,
    values: Vec<Option<String>>,
}

impl KernelParam {
    fn matches(&self, key: &str) -> bool {
        ParameterKey(self.key.as_bytes()) == ParameterKey(key.as_bytes())
    }
}

/// An ordered kernel command line under construction.
///
/// Each key appears once and keeps the position of its first insertion;
/// repeated values accumulate on that key (e.g. multiple `console=`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct KernelCmdline {
    params: Vec<KernelParam>,
}

impl KernelCmdline {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.params.iter().position(|p| p.matches(key))
    }

    /// Add a value for `key`. An identical value already present is not
    /// duplicated.
    pub(crate) fn append(&mut self, key: &str, value: Option<&str>) {
        let value = value.map(ToOwned::to_owned);
        match self.position(key) {
            Some(i) => {
                let values = &mut self.params[i].values;
                if !values.contains(&value) {
                    values.push(value);
                }
            }
            None => self.params.push(KernelParam {
                key: key.to_owned(),
                values: vec![value],
            }),
        }
    }

    /// Replace every value of `key` in place, or append it if absent.
    pub(crate) fn set(&mut self, key: &str, value: Option<&str>) {
        match self.position(key) {
            Some(i) => self.params[i].values = vec![value.map(ToOwned::to_owned)],
            None => self.append(key, value),
        }
    }

    /// Append each argument (which may itself hold several whitespace
    /// separated parameters). For keys listed in `overwrite`, the first
    /// occurrence replaces any existing values and later occurrences append.
    pub(crate) fn append_all<S: AsRef<str>>(&mut self, args: &[S], overwrite: &[&str]) -> Result<()> {
        self.apply(args, |key| {
            overwrite
                .iter()
                .any(|k| ParameterKey(k.as_bytes()) == ParameterKey(key.as_bytes()))
        })
    }

    /// Like [`Self::append_all`] with every key overwritable: values given
    /// here replace whatever was present before, while multiple values for
    /// one key within `args` are all kept.
    pub(crate) fn set_all<S: AsRef<str>>(&mut self, args: &[S]) -> Result<()> {
        self.apply(args, |_| true)
    }

    fn apply<S: AsRef<str>>(&mut self, args: &[S], overwrite: impl Fn(&str) -> bool) -> Result<()> {
        let mut reset: Vec<String> = Vec::new();
        for arg in args {
            let arg = arg.as_ref();
            let cmdline = Cmdline::from(arg);
            for param in cmdline.iter() {
                let key = param.key_str()?;
                if key.is_empty() {
                    anyhow::bail!("Invalid kernel argument {arg:?}: empty key");
                }
                let value = param.value_str()?;
                let first = !reset.iter().any(|k| {
                    ParameterKey(k.as_bytes()) == ParameterKey(key.as_bytes())
                });
                if first && overwrite(key) {
                    reset.push(key.to_owned());
                    self.set(key, value);
                } else {
                    self.append(key, value);
                }
            }
        }
        Ok(())
    }

    /// Return the values of `key`, if present.
    pub(crate) fn get(&self, key: &str) -> Option<Vec<Option<&str>>> {
        self.position(key)
            .map(|i| self.params[i].values.iter().map(|v| v.as_deref()).collect())
    }

    /// Whether `key` is present.
    pub(crate) fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }
}

impl Display for KernelCmdline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for param in &self.params {
            for value in &param.values {
                if !first {
                    f.write_str(" ")?;
                }
                first = false;
                match value {
                    None => f.write_str(&param.key)?,
                    Some(v) if v.chars().any(char::is_whitespace) => {
                        write!(f, "{}=\"{v}\"", param.key)?
                    }
                    Some(v) => write!(f, "{}={v}", param.key)?,
                }
            }
        }
        Ok(())
    }
}
