//! Deterministic branch and directory naming for task workspaces.

const SLUG_MAX_LEN: usize = 40;

/// Lowercase ASCII slug: alphanumeric runs joined by `-`, capped in length.
pub fn slugify(title: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
            if slug.len() >= SLUG_MAX_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

/// Branch for a task: `task/{id}-{slug}`, or `task/{id}` for untitled tasks.
pub fn task_branch_name(task_id: &str, title: &str) -> String {
    let id = slugify(task_id);
    let slug = slugify(title);
    if slug.is_empty() {
        format!("task/{id}")
    } else {
        format!("task/{id}-{slug}")
    }
}

/// Directory name for a task workspace under the per-project root.
pub fn workspace_dir_name(task_id: &str) -> String {
    format!("task-{}", slugify(task_id))
}
