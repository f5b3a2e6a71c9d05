//! Tasks that fan out into subtasks.
//!
//! Both tasks clone a list of template specs once per item, replacing
//! `${key}` placeholders in the name and in every string argument. The
//! substitution values are local to the task; nothing is shared with other
//! tasks.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use steprun_core::TaskSpec;

use crate::storage::split_glob;
use crate::task::{parse_args, BlockingTask, TaskContext, TaskError, TaskOutput};

/// Replace `${key}` placeholders in a spec's name and string arguments.
pub fn substitute(spec: &TaskSpec, vars: &BTreeMap<&str, String>) -> TaskSpec {
    let mut out = spec.clone();
    out.name = replace_vars(&spec.name, vars);
    for value in out.args.values_mut() {
        substitute_value(value, vars);
    }
    out
}

fn substitute_value(value: &mut Value, vars: &BTreeMap<&str, String>) {
    match value {
        Value::String(s) => *s = replace_vars(s, vars),
        Value::Array(items) => items.iter_mut().for_each(|v| substitute_value(v, vars)),
        Value::Object(map) => map.values_mut().for_each(|v| substitute_value(v, vars)),
        _ => {}
    }
}

fn replace_vars(input: &str, vars: &BTreeMap<&str, String>) -> String {
    let mut out = input.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("${{{key}}}"), value);
    }
    out
}

/// Collapse runs of `/` into one, except right after a `:` (URI schemes).
fn collapse_slashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut prev: Option<char> = None;
    let mut before_prev: Option<char> = None;
    for c in input.chars() {
        if c == '/' && prev == Some('/') && before_prev != Some(':') {
            continue;
        }
        before_prev = prev;
        prev = Some(c);
        out.push(c);
    }
    out
}

fn collapse_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = collapse_slashes(s),
        Value::Array(items) => items.iter_mut().for_each(collapse_value),
        Value::Object(map) => map.values_mut().for_each(collapse_value),
        _ => {}
    }
}

#[derive(Debug, Deserialize)]
struct ExplodeArgs {
    foreach: Vec<String>,
    #[serde(rename = "do")]
    templates: Vec<TaskSpec>,
}

/// Spawns every template once per `foreach` item, with `${each}` replaced.
#[derive(Debug)]
pub struct Explode {
    foreach: Vec<String>,
    templates: Vec<TaskSpec>,
}

impl Explode {
    /// Build from a spec with `foreach` and `do`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: ExplodeArgs = parse_args(spec)?;
        Ok(Self {
            foreach: args.foreach,
            templates: args.templates,
        })
    }
}

impl BlockingTask for Explode {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut output = TaskOutput::default();
        for item in &self.foreach {
            let vars = BTreeMap::from([("each", item.clone())]);
            for template in &self.templates {
                output.subtasks.push(substitute(template, &vars));
            }
        }
        info!(task_id = %ctx.task_id, subtasks = output.subtasks.len(), "Exploded into subtasks");
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct ExplodeGlobArgs {
    glob: String,
    #[serde(rename = "do")]
    templates: Vec<TaskSpec>,
}

/// Spawns every template once per file matching a glob.
///
/// Placeholders available to the templates, for `in/items/**/*.json`
/// matching `in/items/furniture/chair.json`:
///
/// | key            | value                            |
/// |----------------|----------------------------------|
/// | `match_prefix` | `in/items`                       |
/// | `match_path`   | `furniture`                      |
/// | `match_stem`   | `chair`                          |
/// | `match_ext`    | `json`                           |
/// | `uri`          | `in/items/furniture/chair.json`  |
/// | `uuid`         | a fresh UUID v4                  |
#[derive(Debug)]
pub struct ExplodeGlob {
    glob: String,
    templates: Vec<TaskSpec>,
}

impl ExplodeGlob {
    /// Build from a spec with `glob` and `do`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: ExplodeGlobArgs = parse_args(spec)?;
        Ok(Self {
            glob: args.glob,
            templates: args.templates,
        })
    }

    fn vars_for(prefix: &str, uri: &str) -> BTreeMap<&'static str, String> {
        let relative = uri.strip_prefix(prefix).unwrap_or(uri).trim_start_matches('/');
        let match_prefix = uri
            .strip_suffix(relative)
            .unwrap_or_default()
            .trim_end_matches('/');
        let (match_path, filename) = relative.rsplit_once('/').unwrap_or(("", relative));
        let (match_stem, match_ext) = match filename.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem, ext),
            _ => (filename, ""),
        };
        BTreeMap::from([
            ("uri", uri.to_string()),
            ("match_prefix", match_prefix.to_string()),
            ("match_path", match_path.to_string()),
            ("match_stem", match_stem.to_string()),
            ("match_ext", match_ext.to_string()),
            ("uuid", Uuid::new_v4().to_string()),
        ])
    }
}

impl BlockingTask for ExplodeGlob {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let (prefix, pattern) = split_glob(&self.glob);
        let files = if pattern.is_empty() {
            if ctx.storage().exists(prefix)? {
                vec![prefix.to_string()]
            } else {
                Vec::new()
            }
        } else {
            ctx.storage().list(prefix.trim_end_matches('/'), pattern)?
        };

        let work_path = ctx.work_path.to_string_lossy().to_string();
        let mut output = TaskOutput::default();
        for file in &files {
            let uri = match file.strip_prefix(&work_path) {
                Some(rest) if !work_path.is_empty() => rest.trim_start_matches('/'),
                _ => file.as_str(),
            };
            let prefix = match prefix.strip_prefix(&work_path) {
                Some(rest) if !work_path.is_empty() => rest.trim_start_matches('/'),
                _ => prefix,
            };
            let vars = Self::vars_for(prefix, uri);
            for template in &self.templates {
                let mut spec = substitute(template, &vars);
                spec.args.values_mut().for_each(collapse_value);
                output.subtasks.push(spec);
            }
        }

        info!(
            task_id = %ctx.task_id,
            glob = %self.glob,
            matches = files.len(),
            subtasks = output.subtasks.len(),
            "Exploded glob into subtasks"
        );
        Ok(output.with_result("matches", files.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::TaskId;

    fn template(name: &str) -> Value {
        serde_json::json!({ "name": name, "source": "${uri}", "destination": "out/${match_path}/${match_stem}.txt" })
    }

    #[test]
    fn test_substitute_nested_values() {
        let spec = TaskSpec::new("copy ${each}")
            .with_arg("source", "in/${each}.csv")
            .with_arg("extra", serde_json::json!({ "list": ["${each}", 1] }));
        let vars = BTreeMap::from([("each", "a".to_string())]);
        let out = substitute(&spec, &vars);
        assert_eq!(out.name, "copy a");
        assert_eq!(out.args["source"], "in/a.csv");
        assert_eq!(out.args["extra"]["list"][0], "a");
        assert_eq!(out.args["extra"]["list"][1], 1);
    }

    #[test]
    fn test_collapse_slashes() {
        assert_eq!(collapse_slashes("out//a///b"), "out/a/b");
        assert_eq!(collapse_slashes("gs://bucket//x"), "gs://bucket/x");
    }

    #[test]
    fn test_explode_foreach() {
        let spec = TaskSpec::new("explode letters")
            .with_arg("foreach", vec!["a", "b"])
            .with_arg(
                "do",
                vec![serde_json::json!({ "name": "hello_world ${each}", "who": "${each}" })],
            );
        let mut task = Explode::from_spec(&spec).unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "explode letters", ".");
        let out = task.run(&ctx).unwrap();
        let names: Vec<&str> = out.subtasks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["hello_world a", "hello_world b"]);
        assert_eq!(out.subtasks[1].args["who"], "b");
    }

    #[test]
    fn test_vars_for_match() {
        let vars = ExplodeGlob::vars_for("in/items/", "in/items/furniture/chair.json");
        assert_eq!(vars["match_prefix"], "in/items");
        assert_eq!(vars["match_path"], "furniture");
        assert_eq!(vars["match_stem"], "chair");
        assert_eq!(vars["match_ext"], "json");

        let vars = ExplodeGlob::vars_for("in/", "in/.hidden");
        assert_eq!(vars["match_stem"], ".hidden");
        assert_eq!(vars["match_ext"], "");
    }

    #[test]
    fn test_explode_glob() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "explode_glob items", dir.path());
        ctx.storage().write("in/items/furniture/chair.json", b"{}").unwrap();
        ctx.storage().write("in/items/lamp.json", b"{}").unwrap();

        let spec = TaskSpec::new("explode_glob items")
            .with_arg("glob", "in/items/**/*.json")
            .with_arg("do", vec![template("copy ${match_stem}")]);
        let mut task = ExplodeGlob::from_spec(&spec).unwrap();
        let out = task.run(&ctx).unwrap();

        let names: Vec<&str> = out.subtasks.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["copy chair", "copy lamp"]);
        assert_eq!(out.subtasks[0].args["source"], "in/items/furniture/chair.json");
        assert_eq!(out.subtasks[1].args["destination"], "out/lamp.txt");
    }
}
