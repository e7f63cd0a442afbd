//! Prompt assembly for agent runs.
//!
//! Implementation and planning prompts are built from the card; follow-ups
//! are passed through as-is; enhancement asks for a `# Title` markdown reply.

/// Build the initial prompt for an attempt.
pub fn build_attempt_prompt(title: &str, description: Option<&str>, is_planning: bool) -> String {
    let mut prompt = format!("# {}\n", title.trim());
    if let Some(description) = description.map(str::trim).filter(|d| !d.is_empty()) {
        prompt.push('\n');
        prompt.push_str(description);
        prompt.push('\n');
    }

    if is_planning {
        prompt.push_str(
            r#"
You are a planning agent. Do not modify any files.
Read the repository, then reply with a step-by-step implementation plan for the task above:
- list the files that need to change and why
- call out risks, open questions and required tests
- keep the plan short enough to review in a few minutes"#,
        );
    } else {
        prompt.push_str(
            r#"
Implement the task above in this working tree.
- Keep changes focused on the task; avoid unrelated refactors.
- Run the relevant tests before finishing.
- Finish with a short summary of what changed."#,
        );
    }
    prompt
}

/// Normalize a follow-up prompt for a resumed session.
pub fn build_followup_prompt(followup: &str) -> String {
    followup.trim().to_string()
}

/// Build the ticket enhancement prompt.
///
/// The reply is expected to start with a `# Title` line so it can be split back
/// into a title and a description.
pub fn build_enhance_prompt(title: &str, description: Option<&str>) -> String {
    let description = description.map(str::trim).unwrap_or_default();
    format!(
        r#"Rewrite the following ticket so an engineer can pick it up without further context.

Title: {title}
Description:
{description}

Reply with markdown only. The first line must be `# ` followed by an improved title.
The rest is the improved description: context, acceptance criteria, and notes.
Do not modify any files."#,
        title = title.trim(),
    )
}

/// Lowercase slug with runs of non-alphanumerics collapsed to a single `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
