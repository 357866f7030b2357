use crate::catalog::{ParamKind, ParamSpec, ToolDefinition};
use crate::job::ToolSelection;
use crate::paths::{artifact_base, JobPaths};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

const TARGET_PLACEHOLDERS: &[&str] = &[
    "target",
    "target_domain",
    "target_url",
    "target_host_or_ip",
    "target_ip_range",
];

const OUTPUT_PLACEHOLDERS: &[&str] = &[
    "output_file",
    "output_file_base",
    "output_file_json",
    "output_file_xml",
    "output_file_dir",
];

/// Build failures are recorded against the single (tool, target) pair
/// and never abort the job. `ToolNotFound` is kept distinct so the
/// caller can mark the pair `skipped` instead of `error`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("tool '{tool}' has an empty command template")]
    EmptyTemplate { tool: String },
    #[error("unknown placeholder '{{{placeholder}}}' in template of tool '{tool}'")]
    UnknownPlaceholder { tool: String, placeholder: String },
    #[error("cannot tokenize command for tool '{tool}' on '{target}': {reason}")]
    Tokenize {
        tool: String,
        target: String,
        reason: String,
    },
    #[error("executable '{binary}' for tool '{tool}' not found on PATH")]
    ToolNotFound { tool: String, binary: String },
}

impl BuildError {
    pub fn is_tool_missing(&self) -> bool {
        matches!(self, BuildError::ToolNotFound { .. })
    }
}

/// Either a literal argument vector or a string handed to `sh -c`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Argv(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub invocation: Invocation,
    /// Human-readable command line for logs and the run record.
    pub display: String,
    /// Where the primary artifact is expected after the run.
    pub artifact_path: PathBuf,
    /// Base name for per-run files (`<base>_raw.log` etc.).
    pub artifact_base: String,
    /// Template designated an output file/directory itself; when
    /// false the runner mirrors stdout into `artifact_path`.
    pub declares_output: bool,
}

/// Renders a tool definition plus user inputs into an executable
/// command. Pure except for the PATH lookup at the end.
pub struct CommandBuilder<'a> {
    tool: &'a ToolDefinition,
    target: &'a str,
    paths: &'a JobPaths,
}

impl<'a> CommandBuilder<'a> {
    pub fn new(tool: &'a ToolDefinition, target: &'a str, paths: &'a JobPaths) -> Self {
        Self {
            tool,
            target,
            paths,
        }
    }

    pub fn build(&self, selection: &ToolSelection) -> Result<BuiltCommand, BuildError> {
        let template = self.tool.command_template.trim();
        if template.is_empty() {
            return Err(BuildError::EmptyTemplate {
                tool: self.tool.id.clone(),
            });
        }

        let base = artifact_base(&self.tool.id, self.target);
        let outputs_dir = self.paths.tool_outputs();

        let mut subs: BTreeMap<String, String> = BTreeMap::new();
        let quoted_target = shell_words::quote(self.target).into_owned();
        for name in TARGET_PLACEHOLDERS {
            subs.insert((*name).to_string(), quoted_target.clone());
        }
        subs.insert(
            "targets_file".to_string(),
            quote_path(&self.paths.targets_file()),
        );
        subs.insert(
            "output_file".to_string(),
            quote_path(&outputs_dir.join(format!("{base}.txt"))),
        );
        subs.insert(
            "output_file_base".to_string(),
            quote_path(&outputs_dir.join(&base)),
        );
        subs.insert(
            "output_file_json".to_string(),
            quote_path(&outputs_dir.join(format!("{base}.json"))),
        );
        subs.insert(
            "output_file_xml".to_string(),
            quote_path(&outputs_dir.join(format!("{base}.xml"))),
        );
        subs.insert("output_file_dir".to_string(), quote_path(&outputs_dir));

        for spec in &self.tool.params {
            let rendered = render_param(spec, &selection.params);
            subs.insert(spec.name.clone(), rendered.trim().to_string());
        }

        // Single pass over the template; a placeholder not covered by
        // the substitution map fails the build instead of being
        // silently stripped.
        let placeholder_re = Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("static regex");
        for caps in placeholder_re.captures_iter(template) {
            let name = &caps[1];
            if !subs.contains_key(name) {
                return Err(BuildError::UnknownPlaceholder {
                    tool: self.tool.id.clone(),
                    placeholder: name.to_string(),
                });
            }
        }
        let rendered = placeholder_re.replace_all(template, |caps: &regex::Captures| {
            subs[&caps[1]].clone()
        });
        let rendered = collapse_whitespace(&rendered);

        // Primary artifact follows the first output family present in
        // the raw template; plain text is the default.
        let declares_output = OUTPUT_PLACEHOLDERS
            .iter()
            .any(|p| template.contains(&format!("{{{p}}}")));
        let artifact_path = if template.contains("{output_file_json}") {
            outputs_dir.join(format!("{base}.json"))
        } else if template.contains("{output_file_xml}") {
            outputs_dir.join(format!("{base}.xml"))
        } else if template.contains("{output_file_dir}") {
            outputs_dir.clone()
        } else {
            outputs_dir.join(format!("{base}.txt"))
        };

        let extra = selection.extra_args.trim();
        let (invocation, display) = if self.tool.needs_shell {
            let mut line = rendered;
            if !extra.is_empty() {
                let tokens = self.split_tokens(extra)?;
                let quoted: Vec<String> = tokens
                    .iter()
                    .map(|t| shell_words::quote(t).into_owned())
                    .collect();
                line = format!("{} {}", line, quoted.join(" "));
            }
            (Invocation::Shell(line.clone()), line)
        } else {
            let mut argv = self.split_tokens(&rendered)?;
            if !extra.is_empty() {
                argv.extend(self.split_tokens(extra)?);
            }
            if argv.is_empty() {
                return Err(BuildError::Tokenize {
                    tool: self.tool.id.clone(),
                    target: self.target.to_string(),
                    reason: "rendered command is empty".to_string(),
                });
            }
            let display = shell_words::join(argv.iter().map(String::as_str));
            (Invocation::Argv(argv), display)
        };

        // Resolve the base executable so a missing tool is reported as
        // `skipped` before anything is spawned.
        let binary = match &invocation {
            Invocation::Argv(argv) => argv[0].clone(),
            Invocation::Shell(line) => line
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string(),
        };
        if which::which(&binary).is_err() {
            return Err(BuildError::ToolNotFound {
                tool: self.tool.id.clone(),
                binary,
            });
        }

        Ok(BuiltCommand {
            invocation,
            display,
            artifact_path,
            artifact_base: base,
            declares_output,
        })
    }

    fn split_tokens(&self, input: &str) -> Result<Vec<String>, BuildError> {
        shell_words::split(input).map_err(|e| BuildError::Tokenize {
            tool: self.tool.id.clone(),
            target: self.target.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Effective value then kind-specific rendering. An empty resolved
/// value drops the flag for every kind except `password`, where an
/// explicit empty override is preserved verbatim.
fn render_param(spec: &ParamSpec, overrides: &BTreeMap<String, String>) -> String {
    let override_value = overrides.get(&spec.name);

    match spec.kind {
        ParamKind::Boolean => {
            let enabled = override_value
                .map(|v| is_truthy(v))
                .unwrap_or_else(|| spec.default.as_deref().map(is_truthy).unwrap_or(false));
            if enabled {
                spec.cli_true.clone().unwrap_or_default()
            } else {
                spec.cli_false.clone().unwrap_or_default()
            }
        }
        ParamKind::Multiline => {
            let text = override_value
                .cloned()
                .or_else(|| spec.default.clone())
                .unwrap_or_default();
            let lines: Vec<&str> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect();
            let rendered: Vec<String> = lines
                .iter()
                .map(|line| {
                    let quoted = shell_words::quote(line).into_owned();
                    match &spec.cli_format {
                        Some(format) => format.replace("{value}", &quoted),
                        None => quoted,
                    }
                })
                .collect();
            rendered.join(" ")
        }
        ParamKind::Password => {
            // Secrets are never guessed: an explicit empty override
            // stays empty instead of falling back to the default.
            let value = match override_value {
                Some(v) => Some(v.clone()),
                None => spec.default.clone(),
            };
            match value {
                Some(v) => shell_words::quote(&v).into_owned(),
                None => String::new(),
            }
        }
        ParamKind::Text | ParamKind::Number => {
            let value = match override_value {
                Some(v) if !v.trim().is_empty() => Some(v.clone()),
                _ => spec.default.clone(),
            };
            match value {
                Some(v) if !v.trim().is_empty() => shell_words::quote(&v).into_owned(),
                _ => String::new(),
            }
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn quote_path(path: &std::path::Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn tool(template: &str) -> ToolDefinition {
        ToolDefinition {
            id: "toola".to_string(),
            name: "Tool A".to_string(),
            command_template: template.to_string(),
            params: Vec::new(),
            timeout_secs: Some(600),
            needs_shell: false,
            dangerous: false,
            description: String::new(),
        }
    }

    fn param(name: &str, kind: ParamKind, default: Option<&str>) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            kind,
            default: default.map(str::to_string),
            cli_true: None,
            cli_false: None,
            cli_format: None,
        }
    }

    fn job_paths() -> (tempfile::TempDir, JobPaths) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = JobPaths::new(tmp.path(), "job1");
        paths.create().unwrap();
        (tmp, paths)
    }

    #[test]
    fn renders_target_and_output_file() {
        // `echo` stands in for an installed scanner binary.
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -d {target} -o {output_file}");
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();

        let Invocation::Argv(argv) = &built.invocation else {
            panic!("expected argv invocation");
        };
        assert_eq!(argv[0], "echo");
        assert_eq!(argv[1], "-d");
        assert_eq!(argv[2], "example.com");
        assert_eq!(argv[3], "-o");
        let out = &argv[4];
        assert!(out.starts_with(&paths.tool_outputs().to_string_lossy().to_string()));
        assert!(out.contains("toola_example.com_"));
        assert!(out.ends_with(".txt"));
        assert!(built.declares_output);
        assert_eq!(built.artifact_path.to_string_lossy().as_ref(), out.as_str());
    }

    #[rstest]
    #[case("target_domain")]
    #[case("target_url")]
    #[case("target_host_or_ip")]
    #[case("target_ip_range")]
    fn target_synonyms_resolve_to_target(#[case] placeholder: &str) {
        let (_tmp, paths) = job_paths();
        let tool = tool(&format!("echo {{{placeholder}}}"));
        let built = CommandBuilder::new(&tool, "192.168.0.0/24", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        let Invocation::Argv(argv) = &built.invocation else {
            panic!("expected argv invocation");
        };
        assert_eq!(argv[1], "192.168.0.0/24");
    }

    #[test]
    fn targets_file_resolves_to_job_file() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -l {targets_file}");
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        assert!(built
            .display
            .ends_with(&paths.targets_file().to_string_lossy().to_string()));
    }

    #[test]
    fn shell_unsafe_target_is_escaped() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -d {target}");
        let built = CommandBuilder::new(&tool, "example.com; rm -rf /", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        // After tokenization the whole hostile string stays one argument.
        let Invocation::Argv(argv) = &built.invocation else {
            panic!("expected argv invocation");
        };
        assert_eq!(argv.len(), 3);
        assert_eq!(argv[2], "example.com; rm -rf /");
    }

    #[test]
    fn json_output_family_wins_over_default() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -o {output_file_json}");
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        assert!(built.artifact_path.to_string_lossy().ends_with(".json"));
    }

    #[test]
    fn dir_output_family_maps_to_outputs_dir() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -d {target} -oD {output_file_dir}");
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        assert_eq!(built.artifact_path, paths.tool_outputs());
    }

    #[test]
    fn boolean_param_renders_literal_flag() {
        let (_tmp, paths) = job_paths();
        let mut tool = tool("echo {target} {open_only}");
        tool.params.push(ParamSpec {
            name: "open_only".to_string(),
            kind: ParamKind::Boolean,
            default: Some("false".to_string()),
            cli_true: Some("--verbose".to_string()),
            cli_false: Some(String::new()),
            cli_format: None,
        });
        let mut selection = ToolSelection::new("toola");
        selection
            .params
            .insert("open_only".to_string(), "true".to_string());
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        assert_eq!(built.display, "echo example.com --verbose");

        // Unset boolean falls back to cli_false and vanishes entirely.
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        assert_eq!(built.display, "echo example.com");
    }

    #[test]
    fn multiline_param_uses_per_line_format() {
        let (_tmp, paths) = job_paths();
        let mut tool = tool("echo {target} {headers}");
        tool.params.push(ParamSpec {
            name: "headers".to_string(),
            kind: ParamKind::Multiline,
            default: None,
            cli_true: None,
            cli_false: None,
            cli_format: Some("-H {value}".to_string()),
        });
        let mut selection = ToolSelection::new("toola");
        selection.params.insert(
            "headers".to_string(),
            "X-Api: one\n\nCookie: s=1\n".to_string(),
        );
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        assert_eq!(
            built.display,
            "echo example.com -H 'X-Api: one' -H 'Cookie: s=1'"
        );
    }

    #[test]
    fn empty_override_falls_back_to_default_except_password() {
        let (_tmp, paths) = job_paths();
        let mut tool = tool("echo {target} {threads} {api_key}");
        tool.params
            .push(param("threads", ParamKind::Number, Some("50")));
        tool.params
            .push(param("api_key", ParamKind::Password, Some("s3cret")));

        let mut selection = ToolSelection::new("toola");
        selection.params.insert("threads".to_string(), String::new());
        selection.params.insert("api_key".to_string(), String::new());

        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        // threads empty -> default 50; api_key empty -> preserved empty arg.
        let Invocation::Argv(argv) = &built.invocation else {
            panic!("expected argv invocation");
        };
        assert_eq!(argv, &vec![
            "echo".to_string(),
            "example.com".to_string(),
            "50".to_string(),
            String::new(),
        ]);
    }

    #[test]
    fn empty_scalar_without_default_drops_flag() {
        let (_tmp, paths) = job_paths();
        let mut tool = tool("echo {target} {rate}");
        tool.params.push(param("rate", ParamKind::Number, None));
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap();
        assert_eq!(built.display, "echo example.com");
    }

    #[test]
    fn unknown_placeholder_fails_the_build() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo {target} {stale_option}");
        let err = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap_err();
        assert!(matches!(err, BuildError::UnknownPlaceholder { .. }));
        assert!(err.to_string().contains("stale_option"));
    }

    #[test]
    fn unbalanced_quotes_are_a_tokenize_error() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo \"unterminated {target}");
        let err = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap_err();
        assert!(matches!(err, BuildError::Tokenize { .. }));
        assert!(!err.is_tool_missing());
    }

    #[test]
    fn missing_executable_is_distinguishable() {
        let (_tmp, paths) = job_paths();
        let tool = tool("definitely-not-a-real-binary-xyz {target}");
        let err = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&ToolSelection::new("toola"))
            .unwrap_err();
        assert!(err.is_tool_missing());
    }

    #[test]
    fn extra_args_are_tokenized_and_appended() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -d {target}");
        let mut selection = ToolSelection::new("toola");
        selection.extra_args = "-t 10 --source 'a b'".to_string();
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        let Invocation::Argv(argv) = &built.invocation else {
            panic!("expected argv invocation");
        };
        assert_eq!(
            argv[3..],
            ["-t".to_string(), "10".to_string(), "--source".to_string(), "a b".to_string()]
        );
    }

    #[test]
    fn shell_mode_returns_rendered_line() {
        let (_tmp, paths) = job_paths();
        let mut tool = tool("echo {target} | head -5");
        tool.needs_shell = true;
        let mut selection = ToolSelection::new("toola");
        selection.extra_args = "-x 'two words'".to_string();
        let built = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        match &built.invocation {
            Invocation::Shell(line) => {
                assert_eq!(line, "echo example.com | head -5 -x 'two words'");
            }
            other => panic!("expected shell invocation, got {other:?}"),
        }
    }

    #[test]
    fn build_is_deterministic_apart_from_timestamp() {
        let (_tmp, paths) = job_paths();
        let tool = tool("echo -d {target}");
        let selection = ToolSelection::new("toola");
        let a = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        let b = CommandBuilder::new(&tool, "example.com", &paths)
            .build(&selection)
            .unwrap();
        assert_eq!(a.display, b.display);
    }
}
