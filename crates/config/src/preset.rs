use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use fanout_template::CommandSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A named command template. Positional parameters are available to the
/// template both as `{{ args.N }}` and under their declared names.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preset {
    pub command: Vec<String>,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "require_item_default")]
    pub require_item: bool,
}

fn require_item_default() -> bool {
    true
}

impl Preset {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            params: Vec::new(),
            description: None,
            require_item: true,
        }
    }

    pub fn with_params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Compiles the preset with its positional parameters bound.
    pub fn spec(&self, name: &str, params: &[String]) -> Result<CommandSpec> {
        if params.len() != self.params.len() {
            exn::bail!(ErrorKind::PresetParameters {
                name: name.to_string(),
                expected: self.params.len(),
                given: params.len(),
            });
        }
        let mut spec = self.compile(name)?.with_args(params.iter().cloned());
        for (key, value) in self.params.iter().zip(params) {
            spec = spec.with_var(key.clone(), value.clone());
        }
        Ok(spec)
    }

    /// Checks the command compiles, that its program is not taken from the
    /// item, and that it references the item when it has to.
    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        let invalid = || ErrorKind::InvalidPreset(name.to_string());
        let program = self.command.first().ok_or_raise(invalid)?;
        let program_spec = CommandSpec::new([program.as_str()]).or_raise(invalid)?;
        if program_spec.references_item() {
            tracing::error!(preset = name, program = %program, "Preset program must not depend on the item");
            exn::bail!(invalid());
        }
        self.compile(name).map(|_| ())
    }

    fn compile(&self, name: &str) -> Result<CommandSpec> {
        let invalid = || ErrorKind::InvalidPreset(name.to_string());
        let spec = CommandSpec::new(self.command.iter().cloned()).or_raise(invalid)?;
        if self.require_item {
            return spec.require_item().or_raise(invalid);
        }
        Ok(spec)
    }
}

/// Presets available without any configuration file.
pub fn builtin_presets() -> BTreeMap<String, Preset> {
    BTreeMap::from([
        (
            "checksum".to_string(),
            Preset::new(["sha256sum", "{{ item }}"]).with_description("SHA-256 checksum of every file"),
        ),
        (
            "gzip".to_string(),
            Preset::new(["gzip", "-k", "{{ item }}"]).with_description("Compress every file, keeping the original"),
        ),
        (
            "ping".to_string(),
            Preset::new(["ping", "-c", "1", "{{ item }}"]).with_description("Ping every host once"),
        ),
        (
            "ssh".to_string(),
            Preset::new(["ssh", "{{ item }}", "{{ args.0 }}"])
                .with_params(["command"])
                .with_description("Run a command on every host"),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use fanout_source::WorkItem;
    use rstest::rstest;

    #[test]
    fn test_builtins_are_valid() {
        for (name, preset) in builtin_presets() {
            preset.validate(&name).unwrap();
        }
    }

    #[test]
    fn test_parameters_by_position_and_name() {
        let preset = Preset::new(["scp", "{{ item }}", "{{ host }}:{{ args.1 }}"]).with_params(["host", "dir"]);
        let spec = preset.spec("copy", &["backup".to_string(), "/srv".to_string()]).unwrap();
        let invocation = spec.resolve(&WorkItem::new(0, "a.tar")).unwrap();
        assert_eq!(invocation.args(), ["a.tar", "backup:/srv"]);
    }

    #[test]
    fn test_wrong_parameter_count() {
        let presets = builtin_presets();
        let err = presets["ssh"].spec("ssh", &[]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::PresetParameters { expected: 1, given: 0, .. }));
    }

    #[rstest]
    #[case::empty(Preset::new(Vec::<String>::new()))]
    #[case::templated_program(Preset::new(["{{ item }}", "--version"]))]
    #[case::no_item(Preset::new(["uptime"]))]
    #[case::syntax(Preset::new(["echo", "{{ item"]))]
    fn test_invalid_presets(#[case] preset: Preset) {
        let err = preset.validate("broken").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPreset(name) if name == "broken"));
    }

    #[test]
    fn test_item_optional_when_not_required() {
        let preset = Preset { require_item: false, ..Preset::new(["uptime"]) };
        preset.validate("uptime").unwrap();
    }
}
