use fanout_source::WorkItem;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};

/// A fully resolved command for exactly one [`WorkItem`].
///
/// The program and arguments are kept as separate strings and must be passed
/// to the operating system as a vector. [`Display`] renders a shell-quoted
/// line for logs only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    item: WorkItem,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(item: WorkItem, program: impl Into<String>, args: Vec<String>, cwd: Option<PathBuf>) -> Self {
        Self { item, program: program.into(), args, cwd }
    }

    pub fn item(&self) -> &WorkItem {
        &self.item
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }
}

fn quote(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    let plain = !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+' | ','));
    if plain {
        f.write_str(s)
    } else {
        write!(f, "'{}'", s.replace('\'', r"'\''"))
    }
}

impl Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        quote(f, &self.program)?;
        for arg in &self.args {
            f.write_str(" ")?;
            quote(f, arg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_only_when_needed() {
        let invocation = Invocation::new(
            WorkItem::new(0, "x"),
            "cp",
            vec!["my file.txt".to_string(), "it's".to_string(), "out/".to_string(), String::new()],
            None,
        );
        assert_eq!(invocation.to_string(), r"cp 'my file.txt' 'it'\''s' out/ ''");
    }
}
