//! Static registry of template variables.
//!
//! Every `{name}` placeholder in a prompt template must resolve to one entry of
//! [`VARIABLES`]. Aliases and deprecated aliases map to the canonical name; the
//! table is fixed at compile time so lookups never depend on runtime state.

use std::collections::HashMap;
use std::sync::LazyLock;

use tracing::warn;

/// One declared template variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableDef {
    pub canonical_name: &'static str,
    pub description: &'static str,
    pub aliases: &'static [&'static str],
    pub deprecated_aliases: &'static [&'static str],
}

const fn var(
    canonical_name: &'static str,
    description: &'static str,
    aliases: &'static [&'static str],
    deprecated_aliases: &'static [&'static str],
) -> VariableDef {
    VariableDef {
        canonical_name,
        description,
        aliases,
        deprecated_aliases,
    }
}

pub const VARIABLES: &[VariableDef] = &[
    var("user_input", "Latest user instruction for this iteration", &["user_prompt"], &["user_inputs"]),
    var("task_description", "Characterization of the ML task", &["task"], &["task_descriptions"]),
    var("data_prompt", "Summary of the files in the input folder", &["data_summary"], &["data_prompts"]),
    var("input_data_folder", "Absolute path of the input folder", &["input_folder"], &[]),
    var("output_folder", "Directory the generated program must write results to", &[], &[]),
    var("iteration_folder", "Directory holding this node's artifacts", &["node_folder"], &[]),
    var("python_file_path", "Absolute path of the generated python file", &[], &[]),
    var("python_code", "Python code generated for the current node", &["code"], &[]),
    var("previous_python_code", "Python code of the parent node", &["previous_code"], &["prev_python_code"]),
    var("bash_script", "Bash script generated for the current node", &[], &[]),
    var("previous_bash_script", "Bash script of the parent node", &[], &["prev_bash_script"]),
    var("error_message", "Error recorded for the current node", &[], &[]),
    var("previous_error_message", "Error recorded for the parent node", &[], &["prev_error_message"]),
    var("previous_error_prompt", "Composed debugging section for a debug node", &[], &[]),
    var("all_error_analyses", "Recent error analyses across the run", &["error_analyses"], &[]),
    var("tutorial_prompt", "Reranked tutorials for the current node", &["tutorials"], &[]),
    var("previous_tutorial_prompt", "Reranked tutorials of the parent node", &[], &[]),
    var("tutorial_retrieval", "Raw ranked tutorial candidates", &["tutorial_candidates"], &[]),
    var("search_query", "Query used for tutorial retrieval", &[], &[]),
    var("selected_tool", "Tool chosen for the current node", &["tool_name"], &["selected_library"]),
    var("tool_prompt", "Prompt fragment of the selected tool", &["tool_fragment"], &[]),
    var("available_tools", "Catalog listing presented to the tool selector", &[], &["available_libraries"]),
    var("environment_prompt", "Environment setup instructions for the bash coder", &[], &[]),
    var("system_resources_prompt", "Hardware resource guidance", &[], &[]),
    var("stdout", "Captured standard output of the execution", &[], &[]),
    var("stderr", "Captured standard error of the execution", &[], &[]),
    var("validation_prompt", "Instructions about validation scoring", &[], &[]),
    var("best_code_prompt", "Successful parent solution to improve upon", &["previous_code_prompt"], &[]),
    var("file_path", "File inspected by the python reader", &[], &[]),
    var("file_size_mb", "Size of the inspected file in megabytes", &[], &[]),
    var("max_chars", "Character budget for the reader output", &[], &[]),
    var("data_file_list", "Relative paths of all input files", &[], &[]),
    var("description_file_contents", "Contents of files describing the task", &[], &[]),
    var("max_num_tutorials", "Number of tutorials the reranker keeps", &[], &[]),
    var("template", "Template text handed to the meta prompting agent", &[], &[]),
    var("target_agent", "Agent whose template is being rewritten", &[], &[]),
];

/// Result of resolving a name against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub def: &'static VariableDef,
    pub deprecated: bool,
}

static INDEX: LazyLock<HashMap<&'static str, (usize, bool)>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for (idx, def) in VARIABLES.iter().enumerate() {
        map.insert(def.canonical_name, (idx, false));
        for alias in def.aliases {
            map.insert(*alias, (idx, false));
        }
        for alias in def.deprecated_aliases {
            map.insert(*alias, (idx, true));
        }
    }
    map
});

/// Resolve `name` (canonical, alias or deprecated alias) without logging.
pub fn resolve(name: &str) -> Option<Resolved> {
    INDEX.get(name).map(|(idx, deprecated)| Resolved {
        def: &VARIABLES[*idx],
        deprecated: *deprecated,
    })
}

/// Resolve `name` to its canonical name, warning when a deprecated alias is used.
pub fn canonical_name(name: &str) -> Option<&'static str> {
    let resolved = resolve(name)?;
    if resolved.deprecated {
        warn!(
            alias = name,
            canonical = resolved.def.canonical_name,
            "deprecated template variable"
        );
    }
    Some(resolved.def.canonical_name)
}

pub fn is_registered(name: &str) -> bool {
    INDEX.contains_key(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn aliases_map_to_canonical_entry() {
        assert_eq!(canonical_name("task"), Some("task_description"));
        assert_eq!(canonical_name("task_descriptions"), Some("task_description"));
        assert_eq!(canonical_name("previous_code"), Some("previous_python_code"));
        assert_eq!(canonical_name("nope"), None);
    }

    #[test]
    fn deprecated_aliases_are_flagged() {
        let resolved = resolve("prev_python_code").expect("registered");
        assert!(resolved.deprecated);
        assert!(!resolve("previous_python_code").expect("registered").deprecated);
    }

    #[test]
    fn no_name_is_declared_twice() {
        let mut seen = HashSet::new();
        for def in VARIABLES {
            let names = std::iter::once(&def.canonical_name)
                .chain(def.aliases.iter())
                .chain(def.deprecated_aliases.iter());
            for name in names {
                assert!(seen.insert(*name), "duplicate variable name {name}");
            }
        }
    }
}
