use std::sync::Arc;

use chrono::Utc;
use roadmap_engine::collaborators::LogNotifier;
use roadmap_engine::phase::{NextPhase, PhaseManager};
use roadmap_engine::roadmap_core::models::{Phase, RoadmapStep, StepStatus};
use roadmap_engine::roadmap_core::{MemoryRepository, RoadmapManifest};
use roadmap_engine::EngineConfig;
use uuid::Uuid;

/// A manifest shape with the next phase a person planning it would pick.
struct Labeled {
    name: &'static str,
    phases: Vec<Phase>,
    /// Phases with every step completed.
    done: &'static [&'static str],
    /// Phases with one of their two steps completed.
    started: &'static [&'static str],
    expected: Option<&'static str>,
}

fn build(case: &Labeled) -> RoadmapManifest {
    let steps: Vec<RoadmapStep> = case
        .phases
        .iter()
        .flat_map(|p| {
            [
                RoadmapStep::new(format!("{} first", p.id), p.id.clone()),
                RoadmapStep::new(format!("{} second", p.id), p.id.clone()),
            ]
        })
        .collect();
    let mut manifest =
        RoadmapManifest::new(Uuid::new_v4(), case.name, case.phases.clone(), steps).unwrap();

    let now = Utc::now();
    let ids: Vec<(Uuid, String, bool)> = manifest
        .steps()
        .iter()
        .map(|s| (s.id, s.phase.clone(), s.title.ends_with("first")))
        .collect();
    for (id, phase, first) in ids {
        let finish = case.done.contains(&phase.as_str())
            || (first && case.started.contains(&phase.as_str()));
        if finish {
            manifest.set_status(id, StepStatus::Completed, now).unwrap();
        }
    }
    manifest
}

fn corpus() -> Vec<Labeled> {
    vec![
        Labeled {
            name: "linear, first done",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("b"),
            ],
            done: &["a"],
            started: &[],
            expected: Some("b"),
        },
        Labeled {
            name: "linear, two done",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("b"),
            ],
            done: &["a", "b"],
            started: &[],
            expected: Some("c"),
        },
        Labeled {
            name: "fork, prioritized branch",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("a").with_priority(2.0),
            ],
            done: &["a"],
            started: &[],
            expected: Some("c"),
        },
        Labeled {
            name: "fork, declared order decides",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("a"),
            ],
            done: &["a"],
            started: &[],
            expected: Some("b"),
        },
        Labeled {
            name: "diamond, join ready",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("a"),
                Phase::new("d", 4).requires("b").requires("c"),
            ],
            done: &["a", "b", "c"],
            started: &[],
            expected: Some("d"),
        },
        Labeled {
            name: "diamond, one side left",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("a"),
                Phase::new("d", 4).requires("b").requires("c"),
            ],
            done: &["a", "b"],
            started: &[],
            expected: Some("c"),
        },
        Labeled {
            name: "fresh roadmap",
            phases: vec![Phase::new("x", 1), Phase::new("y", 2)],
            done: &[],
            started: &[],
            expected: Some("x"),
        },
        Labeled {
            name: "fresh roadmap, urgent second root",
            phases: vec![Phase::new("x", 1), Phase::new("y", 2).with_priority(0.5)],
            done: &[],
            started: &[],
            expected: Some("y"),
        },
        Labeled {
            name: "join outranks single prerequisite",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2),
                Phase::new("c", 3).requires("a").requires("b"),
                Phase::new("d", 4).requires("a"),
            ],
            done: &["a", "b"],
            started: &[],
            expected: Some("c"),
        },
        Labeled {
            name: "priority outweighs a join",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2),
                Phase::new("c", 3).requires("a").requires("b"),
                Phase::new("d", 4).requires("a").with_priority(1.5),
            ],
            done: &["a", "b"],
            started: &[],
            expected: Some("d"),
        },
        Labeled {
            name: "everything finished",
            phases: vec![Phase::new("a", 1), Phase::new("b", 2).requires("a")],
            done: &["a", "b"],
            started: &[],
            expected: None,
        },
        Labeled {
            name: "current phase still in progress",
            phases: vec![Phase::new("a", 1), Phase::new("b", 2).requires("a")],
            done: &[],
            started: &["a"],
            expected: None,
        },
        Labeled {
            name: "started sibling is not suggested again",
            phases: vec![
                Phase::new("a", 1),
                Phase::new("b", 2).requires("a"),
                Phase::new("c", 3).requires("a"),
            ],
            done: &["a"],
            started: &["b"],
            expected: Some("c"),
        },
    ]
}

fn manager() -> PhaseManager {
    PhaseManager::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(LogNotifier),
        EngineConfig::default(),
    )
}

#[test]
fn top_suggestion_agrees_with_labels() {
    let manager = manager();
    let corpus = corpus();

    let mut misses = Vec::new();
    for case in &corpus {
        let status = manager.assess(&build(case));
        let top = status.next.candidates().first().map(|c| c.phase_id.as_str());
        if top != case.expected {
            misses.push(format!("{}: got {:?}, expected {:?}", case.name, top, case.expected));
        }
    }

    let agreement = 1.0 - misses.len() as f64 / corpus.len() as f64;
    assert!(agreement >= 0.9, "top-1 agreement {agreement:.2}: {misses:#?}");
}

#[test]
fn no_candidate_is_reported_explicitly() {
    let manager = manager();
    let case = Labeled {
        name: "blocked",
        phases: vec![Phase::new("a", 1), Phase::new("b", 2).requires("a")],
        done: &[],
        started: &["a"],
        expected: None,
    };
    assert_eq!(manager.assess(&build(&case)).next, NextPhase::NoneAvailable);
}
