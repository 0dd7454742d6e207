//! ASCII tree rendering for roadmaps.

use roadmap_core::models::{RoadmapStep, StepStatus};
use roadmap_core::RoadmapManifest;
use uuid::Uuid;

const PENDING: char = '○';
const IN_PROGRESS: char = '◐';
const COMPLETED: char = '●';
const SKIPPED: char = '✗';

fn status_symbol(status: StepStatus) -> char {
    match status {
        StepStatus::Pending => PENDING,
        StepStatus::InProgress => IN_PROGRESS,
        StepStatus::Completed => COMPLETED,
        StepStatus::Skipped => SKIPPED,
    }
}

/// Render the step hierarchy of a roadmap under its goal.
///
/// Example output:
/// ```text
/// Learn Rust (v3)
/// ├── ● Install the toolchain [basics]
/// │   └── ● Hello world [basics]
/// └── ○ Ownership [core] *
/// ```
///
/// `*` marks major-phase steps.
pub fn render_manifest(manifest: &RoadmapManifest) -> String {
    let mut output = format!("{} (v{})\n", manifest.goal(), manifest.version());
    let roots: Vec<&RoadmapStep> = manifest
        .steps()
        .iter()
        .filter(|s| s.parent_id.is_none())
        .collect();
    for (i, step) in roots.iter().enumerate() {
        let is_last = i == roots.len() - 1;
        render_step(&mut output, manifest, step, "", is_last);
    }
    output
}

fn render_step(
    output: &mut String,
    manifest: &RoadmapManifest,
    step: &RoadmapStep,
    prefix: &str,
    is_last: bool,
) {
    let branch = if is_last { "└── " } else { "├── " };
    output.push_str(prefix);
    output.push_str(branch);
    output.push(status_symbol(step.status));
    output.push(' ');
    output.push_str(&step.title);
    output.push_str(&format!(" [{}]", step.phase));
    if step.is_major_phase {
        output.push_str(" *");
    }
    output.push('\n');

    let continuation = if is_last { "    " } else { "│   " };
    let child_prefix = format!("{}{}", prefix, continuation);
    let children: Vec<&RoadmapStep> = manifest.children(step.id).collect();
    for (i, child) in children.iter().enumerate() {
        let child_is_last = i == children.len() - 1;
        render_step(output, manifest, child, &child_prefix, child_is_last);
    }
}

/// One line per step: id, status and title, for listings.
pub fn render_steps(steps: &[RoadmapStep]) -> String {
    steps
        .iter()
        .map(|s| format_step_line(s.id, s.status, &s.title))
        .collect()
}

fn format_step_line(id: Uuid, status: StepStatus, title: &str) -> String {
    format!("{} {} {}\n", status_symbol(status), id, title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadmap_core::models::Phase;

    #[test]
    fn test_goal_only() {
        let manifest =
            RoadmapManifest::new(Uuid::new_v4(), "Learn Rust", vec![Phase::new("p", 1)], vec![])
                .unwrap();
        assert_eq!(render_manifest(&manifest), "Learn Rust (v0)\n");
    }

    #[test]
    fn test_nested_children() {
        let root = RoadmapStep::new("Install the toolchain", "basics")
            .with_status(StepStatus::Completed);
        let child = RoadmapStep::new("Hello world", "basics")
            .with_parent(root.id)
            .with_status(StepStatus::InProgress);
        let other = RoadmapStep::new("Ownership", "core").major();
        let manifest = RoadmapManifest::new(
            Uuid::new_v4(),
            "Learn Rust",
            vec![Phase::new("basics", 1), Phase::new("core", 2)],
            vec![root, child, other],
        )
        .unwrap();

        assert_eq!(
            render_manifest(&manifest),
            "Learn Rust (v0)\n\
             ├── ● Install the toolchain [basics]\n\
             │   └── ◐ Hello world [basics]\n\
             └── ○ Ownership [core] *\n"
        );
    }
}
