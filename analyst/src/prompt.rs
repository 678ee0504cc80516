//! System prompt assembly for a run.

use std::path::PathBuf;

use crate::tools::ToolDefinition;

pub fn system_prompt(
    dataset_paths: &[PathBuf],
    tools: &[ToolDefinition],
    planning_mode: bool,
) -> String {
    let mut prompt = String::from(
        "You are an autonomous data analyst. You solve analysis tasks by writing and \
         running Python code in a persistent session, inspecting the results, and \
         iterating until you can state a final answer.\n\n",
    );

    if !dataset_paths.is_empty() {
        prompt.push_str("Available data:\n");
        for (i, path) in dataset_paths.iter().enumerate() {
            if i == 0 {
                prompt.push_str(&format!(
                    "- DATASET_PATH = \"{}\" (already set in the session)\n",
                    path.display()
                ));
            } else {
                prompt.push_str(&format!("- DATASET_PATHS[{}] = \"{}\"\n", i, path.display()));
            }
        }
        prompt.push_str(
            "pandas (pd), numpy (np) and matplotlib (plt) are pre-imported when \
             installed. Load data with e.g. pd.read_csv(DATASET_PATH).\n\n",
        );
    }

    if !tools.is_empty() {
        prompt.push_str("Tools:\n");
        for def in tools {
            prompt.push_str(&format!("- {}\n  {}\n", def.signature(), def.description));
        }
        prompt.push('\n');
    }

    if planning_mode {
        prompt.push_str(
            "Start your first reply with a short <plan>...</plan> block laying out the \
             steps you intend to take, and restate a revised <plan> when you change \
             course.\n",
        );
    }

    prompt.push_str(
        "Put private reasoning in <think>...</think> blocks. Print anything you need to \
         see; only printed output comes back to you. Call plt.show() to emit a plot.\n\
         When you are confident in the final answer, reply with \
         <solution>...</solution> and stop calling tools.\n",
    );

    prompt
}
