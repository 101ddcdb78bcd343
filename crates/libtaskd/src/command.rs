use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use taskd_protocol::{TaskKind, TaskParameters};

use crate::artifacts::{ArtifactCategory, TaskFiles};
use crate::error::TaskError;
use crate::supervisor::CommandSpec;

/// Placeholders every template may use, whatever its kind.
pub const COMMON_PLACEHOLDERS: &[&str] =
    &["task_id", "task_dir", "input_dir", "output_dir", "model_dir"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        }
    }
}

/// One template per task kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSet {
    #[serde(default = "default_infer")]
    pub infer: CommandTemplate,
    #[serde(default = "default_train")]
    pub train: CommandTemplate,
}

impl Default for CommandSet {
    fn default() -> Self {
        Self {
            infer: default_infer(),
            train: default_train(),
        }
    }
}

fn default_infer() -> CommandTemplate {
    CommandTemplate::new(
        "python",
        &[
            "../scripts/infer.py",
            "{task_id}",
            "{pitch}",
            "{index_ratio}",
            "{input_dir}",
            "{model_dir}",
            "{output_dir}",
        ],
    )
}

fn default_train() -> CommandTemplate {
    CommandTemplate::new(
        "python",
        &[
            "../scripts/train.py",
            "{task_id}",
            "{batch_size}",
            "{epochs}",
            "{sample_rate}",
            "{input_dir}",
            "{output_dir}",
        ],
    )
}

impl CommandSet {
    fn get(&self, kind: TaskKind) -> &CommandTemplate {
        match kind {
            TaskKind::Infer => &self.infer,
            TaskKind::Train => &self.train,
        }
    }
}

/// Validated command templates. Requests only contribute numeric parameters,
/// and each template element renders to exactly one argv entry.
#[derive(Debug, Clone)]
pub struct CommandPolicy {
    commands: CommandSet,
}

impl CommandPolicy {
    /// Reject templates with an empty program, unknown placeholders, or
    /// unbalanced braces.
    pub fn new(commands: CommandSet) -> Result<Self, TaskError> {
        for kind in [TaskKind::Infer, TaskKind::Train] {
            let template = commands.get(kind);
            if template.program.trim().is_empty() {
                return Err(TaskError::InvalidRequest(format!(
                    "{kind} command has an empty program"
                )));
            }
            let allowed = |name: &str| {
                (COMMON_PLACEHOLDERS.contains(&name)
                    || TaskParameters::template_names(kind).contains(&name))
                .then(String::new)
            };
            let fields = std::iter::once(&template.program)
                .chain(&template.args)
                .chain(&template.working_dir);
            for field in fields {
                render(field, allowed).map_err(|reason| {
                    TaskError::InvalidRequest(format!("{kind} command: {reason}"))
                })?;
            }
        }
        Ok(Self { commands })
    }

    /// Resolve the template for `params.kind()` against one task.
    pub fn build(
        &self,
        task_id: &str,
        params: &TaskParameters,
        files: &TaskFiles,
    ) -> Result<CommandSpec, TaskError> {
        let template = self.commands.get(params.kind());
        let path = |p: PathBuf| p.to_string_lossy().into_owned();
        let mut values = vec![
            ("task_id", task_id.to_string()),
            ("task_dir", path(files.task_dir(task_id))),
            ("input_dir", path(files.dir(task_id, ArtifactCategory::Input))),
            ("output_dir", path(files.dir(task_id, ArtifactCategory::Output))),
            ("model_dir", path(files.dir(task_id, ArtifactCategory::Model))),
        ];
        values.extend(params.template_values());
        let lookup = |name: &str| {
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        };

        let resolve = |field: &str| render(field, lookup).map_err(TaskError::InvalidRequest);
        let program = resolve(template.program.as_str())?;
        let args = template
            .args
            .iter()
            .map(|arg| resolve(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;
        let cwd = match template.working_dir.as_deref() {
            Some(dir) => Some(PathBuf::from(resolve(dir)?)),
            None => None,
        };

        Ok(CommandSpec { program, args, cwd })
    }
}

/// Substitute `{name}` occurrences using `lookup`.
fn render(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find(['{', '}']) {
        if rest[open..].starts_with('}') {
            return Err(format!("unbalanced '}}' in {template:?}"));
        }
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unclosed '{{' in {template:?}"))?;
        let name = &after[..close];
        let value = lookup(name).ok_or_else(|| format!("unknown placeholder {{{name}}}"))?;
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
