//! Command templating.
//!
//! A [`CommandSpec`] is an argument vector in which every element is an
//! [upon] template. Binding it to a [`WorkItem`] renders each element
//! independently into an [`Invocation`]: a program and its arguments, ready to
//! hand to a process-launch primitive. No shell is ever involved, so an item
//! value containing spaces, quotes or `;` stays exactly one argument.
//!
//! # Template Variables
//!
//! | Variable   | Type           | Description                                 |
//! |------------|----------------|---------------------------------------------|
//! | `item`     | `String`       | The work item value (path, host, URL)       |
//! | `index`    | `u64`          | Position of the item in enumeration order   |
//! | `args`     | `List<String>` | Positional parameters, fixed for the run    |
//! | *(named)*  | `String`       | Named parameters added with [`CommandSpec::with_var`] |
//!
//! Path-aware formatters `name`, `stem`, `ext` and `parent` are available
//! (`{{ item|stem }}`), as are the functions `with_ext(item, "png")` and
//! `truncate(value, n)`.
//!
//! # Example
//!
//! ```
//! use fanout_source::WorkItem;
//! use fanout_template::CommandSpec;
//!
//! let spec = CommandSpec::new(["convert", "{{ item }}", "-resize", "{{ args.0 }}", "{{ with_ext(item, \"png\") }}"])
//!     .unwrap()
//!     .with_args(["50%"]);
//! let invocation = spec.resolve(&WorkItem::new(0, "holiday snaps/beach.jpg")).unwrap();
//! assert_eq!(invocation.program(), "convert");
//! assert_eq!(invocation.args(), ["holiday snaps/beach.jpg", "-resize", "50%", "holiday snaps/beach.png"]);
//! ```

pub mod error;
mod invocation;

pub use crate::invocation::Invocation;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use fanout_source::WorkItem;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::instrument;
use upon::{Engine, Template, Value};

static ITEM_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{[^}]*\bitem\b[^}]*\}\}").unwrap());

/// Number of logical CPUs, or one if that cannot be determined.
pub fn default_concurrency() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// A command line template plus everything that stays fixed for one run.
///
/// Every element is compiled on construction, so syntax errors
/// surface before any item is enumerated or dispatched. The compiled spec is
/// reused for every [`resolve`](Self::resolve) call.
pub struct CommandSpec {
    engine: Engine<'static>,
    argv: Vec<Template<'static>>,
    raw: Vec<String>,
    args: Vec<String>,
    vars: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    concurrency: NonZeroUsize,
}

impl CommandSpec {
    /// Compiles an argument vector. The first element is the program.
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let raw: Vec<String> = argv.into_iter().map(Into::into).collect();
        if raw.is_empty() {
            exn::bail!(ErrorKind::Empty);
        }
        let mut engine = Engine::new();
        addons::configure(&mut engine);
        let argv = raw
            .iter()
            .enumerate()
            .map(|(position, element)| engine.compile(element.clone()).or_raise(|| ErrorKind::Syntax(position)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            engine,
            argv,
            raw,
            args: Vec::new(),
            vars: BTreeMap::new(),
            cwd: None,
            concurrency: default_concurrency(),
        })
    }

    /// Fails with [`ErrorKind::MissingItem`] unless some element references
    /// `{{ item }}`. Use this for commands that only make sense per item.
    pub fn require_item(self) -> Result<Self> {
        if !self.references_item() {
            exn::bail!(ErrorKind::MissingItem);
        }
        Ok(self)
    }

    pub fn references_item(&self) -> bool {
        self.raw.iter().any(|element| ITEM_REFERENCE.is_match(element))
    }

    /// Positional parameters, available as `{{ args.0 }}`, `{{ args.1 }}`, ...
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// A named parameter. `item`, `index` and `args` always take precedence.
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Working directory for every invocation.
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: NonZeroUsize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn concurrency(&self) -> NonZeroUsize {
        self.concurrency
    }

    /// The uncompiled argument vector, for logging.
    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    /// Binds the template to one item.
    pub fn resolve(&self, item: &WorkItem) -> Result<Invocation> {
        let mut rendered = Vec::with_capacity(self.argv.len());
        for (position, template) in self.argv.iter().enumerate() {
            let value = template
                .render(&self.engine, self.parameters(item))
                .to_string()
                .or_raise(|| ErrorKind::Unresolved { position, item: item.value().to_string() })?;
            rendered.push(value);
        }
        let mut rendered = rendered.into_iter();
        let program = rendered.next().unwrap_or_default();
        if program.trim().is_empty() {
            exn::bail!(ErrorKind::EmptyProgram(item.value().to_string()));
        }
        let invocation = Invocation::new(item.clone(), program, rendered.collect(), self.cwd.clone());
        tracing::trace!(index = item.index(), command = %invocation, "Resolved command");
        Ok(invocation)
    }

    /// Resolves every item up front, so that a template error aborts the run
    /// before anything is dispatched.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn resolve_all(&self, items: &[WorkItem]) -> Result<Vec<Invocation>> {
        items.iter().map(|item| self.resolve(item)).collect()
    }

    fn parameters(&self, item: &WorkItem) -> Value {
        let mut map: BTreeMap<String, Value> =
            self.vars.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect();
        map.insert("item".to_string(), Value::String(item.value().to_string()));
        map.insert("index".to_string(), Value::Integer(i64::try_from(item.index()).unwrap_or(i64::MAX)));
        map.insert("args".to_string(), Value::List(self.args.iter().cloned().map(Value::String).collect()));
        Value::Map(map)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("raw", &self.raw)
            .field("args", &self.args)
            .field("vars", &self.vars)
            .field("cwd", &self.cwd)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Custom [`upon`] extensions for working with item values as paths.
mod addons {
    use std::fmt::Write;
    use std::path::Path;
    use upon::{Engine, Value, fmt as upon_fmt};

    fn path_formatter(
        f: &mut upon_fmt::Formatter<'_>,
        value: &Value,
        part: impl Fn(&Path) -> Option<String>,
    ) -> upon_fmt::Result {
        match value {
            Value::String(s) => write!(f, "{}", part(Path::new(s)).unwrap_or_default())?,
            v => upon_fmt::default(f, v)?,
        };
        Ok(())
    }

    /// Final path component: `a/b/photo.jpg` → `photo.jpg`.
    fn name(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        path_formatter(f, value, |p| p.file_name().map(|s| s.to_string_lossy().into_owned()))
    }

    /// Final component without its extension: `a/b/photo.jpg` → `photo`.
    fn stem(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        path_formatter(f, value, |p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
    }

    /// Extension without the dot: `a/b/photo.jpg` → `jpg`.
    fn ext(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        path_formatter(f, value, |p| p.extension().map(|s| s.to_string_lossy().into_owned()))
    }

    /// Everything but the final component: `a/b/photo.jpg` → `a/b`.
    fn parent(f: &mut upon_fmt::Formatter<'_>, value: &Value) -> upon_fmt::Result {
        path_formatter(f, value, |p| p.parent().map(|s| s.to_string_lossy().into_owned()))
    }

    /// Replaces (or adds) the extension of a path. Leading dots on `ext` are
    /// ignored, so both `"png"` and `".png"` work.
    fn with_ext(path: &str, ext: &str) -> String {
        Path::new(path).with_extension(ext.trim_start_matches('.')).to_string_lossy().into_owned()
    }

    /// Truncates a string to a maximum byte length at a character boundary.
    fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> String {
        s[..s.floor_char_boundary(max_bytes)].to_string()
    }

    pub(crate) fn configure(engine: &mut Engine<'_>) {
        engine.add_formatter("name", name);
        engine.add_formatter("stem", stem);
        engine.add_formatter("ext", ext);
        engine.add_formatter("parent", parent);
        engine.add_function("with_ext", with_ext);
        engine.add_function("truncate", truncate_to_char_boundary);
    }
}
