//! Spawn context and bootstrap prompt assembly.
//!
//! [`SpawnContext`] is the immutable input bundle supplied by the
//! orchestrator for each spawn. It is rendered into a bootstrap prompt
//! file inside the worktree before the agent process starts and is never
//! mutated afterwards.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Immutable context bundle for one spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnContext {
    /// Role definition text ("You are Grunt, the backend developer.").
    pub role_definition: String,
    /// Craft standards the agent must follow.
    pub craft_standards: String,
    /// Project-wide guidelines.
    pub project_guidelines: String,
    /// The assignment itself.
    pub assignment: String,
    /// Environment variables injected into the agent process and echoed
    /// into the prompt.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Skill tags rendered as a bullet list; omitted when empty.
    #[serde(default)]
    pub skills: Vec<String>,
}

/// Uppercase the first character of a role tag for prose use.
fn title_case(role: &str) -> String {
    let mut chars = role.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Assemble the bootstrap prompt handed to the agent CLI.
///
/// The prompt carries the full context bundle plus the git rules that keep
/// the agent on its own branch. Section order matters: identity first,
/// then constraints, then the assignment.
pub fn assemble_prompt(
    role: &str,
    task_ref: &str,
    branch_name: &str,
    context: &SpawnContext,
    worktree_path: &Path,
) -> String {
    let mut prompt = String::new();

    let _ = writeln!(
        prompt,
        "You are {}, spawned to work on {}.",
        title_case(role),
        task_ref
    );

    let _ = write!(
        prompt,
        "\n## YOUR IDENTITY\n\n{}\n",
        context.role_definition.trim_end()
    );

    let _ = write!(
        prompt,
        "\n## CRITICAL GIT RULES\n\n\
         - NEVER push to main. NEVER merge into main.\n\
         - All work happens on your branch: {branch_name}\n\
         - Commit your work to that branch as you go.\n\
         - Do not touch any checkout outside your working directory.\n"
    );

    if !context.environment.is_empty() {
        let _ = write!(prompt, "\n## ENVIRONMENT\n\n");
        let mut keys: Vec<&String> = context.environment.keys().collect();
        keys.sort();
        for key in keys {
            let _ = writeln!(prompt, "export {key}={}", context.environment[key]);
        }
    }

    let _ = write!(
        prompt,
        "\n## WORKING DIRECTORY\n\n{}\n",
        worktree_path.display()
    );

    let _ = write!(
        prompt,
        "\n## ASSIGNMENT: {task_ref}\n\n{}\n",
        context.assignment.trim_end()
    );

    let _ = write!(
        prompt,
        "\n## CRAFT STANDARDS\n\n{}\n",
        context.craft_standards.trim_end()
    );

    let _ = write!(
        prompt,
        "\n## PROJECT GUIDELINES\n\n{}\n",
        context.project_guidelines.trim_end()
    );

    if !context.skills.is_empty() {
        let _ = write!(prompt, "\n## SKILLS\n\n");
        for skill in &context.skills {
            let _ = writeln!(prompt, "- {skill}");
        }
    }

    let _ = write!(prompt, "\nSTART WORKING NOW.\n");

    prompt
}
