use chrono::Utc;
use roadmap_core::db::Database;
use roadmap_core::models::*;
use roadmap_core::{
    ManifestCommit, RepositoryError, RoadmapManifest, RoadmapRepository, SaveOutcome,
};
use speculate2::speculate;
use uuid::Uuid;

fn create_test_manifest(db: &Database, user_id: Uuid) -> RoadmapManifest {
    let a = RoadmapStep::new("Read the book", "basics");
    let b = RoadmapStep::new("Do the exercises", "basics").depends_on(a.id);
    let manifest = RoadmapManifest::new(
        user_id,
        "Learn Rust",
        vec![Phase::new("basics", 1)],
        vec![a, b],
    )
    .expect("Failed to build manifest");
    let audit = AuditDraft::new(AuditAction::Created, None, serde_json::json!({}))
        .into_record(manifest.tree_id(), Uuid::new_v4(), "test", 1);
    db.create_manifest(manifest, audit)
        .expect("Failed to create manifest")
}

fn commit(manifest: RoadmapManifest, expected_version: u64) -> ManifestCommit {
    let audit = AuditDraft::new(AuditAction::Completed, None, serde_json::json!({}))
        .into_record(manifest.tree_id(), Uuid::new_v4(), "test", expected_version + 1);
    ManifestCommit {
        manifest,
        expected_version,
        audit,
        expansion: None,
    }
}

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
        let user_id = Uuid::new_v4();
    }

    describe "create_manifest" {
        it "stores the tree at version 1" {
            let manifest = create_test_manifest(&db, user_id);
            assert_eq!(manifest.version(), 1);

            let loaded = db.get_manifest(manifest.tree_id())
                .expect("Query failed")
                .expect("Tree not found");
            assert_eq!(loaded, manifest);
        }

        it "rejects a tree id that already exists" {
            let manifest = create_test_manifest(&db, user_id);
            let audit = AuditDraft::new(AuditAction::Created, None, serde_json::json!({}))
                .into_record(manifest.tree_id(), Uuid::new_v4(), "test", 1);

            let result = db.create_manifest(manifest.clone(), audit);
            assert!(matches!(result, Err(RepositoryError::TreeExists(id)) if id == manifest.tree_id()));
        }

        it "lists trees per owner" {
            let manifest = create_test_manifest(&db, user_id);
            create_test_manifest(&db, Uuid::new_v4());

            let trees = db.trees_for_user(user_id).expect("Query failed");
            assert_eq!(trees, vec![(manifest.tree_id(), "Learn Rust".to_string(), 1)]);
        }
    }

    describe "get_node" {
        it "returns None for a non-existent step" {
            assert!(db.get_node(Uuid::new_v4()).expect("Query failed").is_none());
        }

        it "returns the step with its tree and owner" {
            let manifest = create_test_manifest(&db, user_id);
            let step = &manifest.steps()[1];

            let record = db.get_node(step.id).expect("Query failed").expect("Step not found");
            assert_eq!(record.tree_id, manifest.tree_id());
            assert_eq!(record.user_id, user_id);
            assert_eq!(&record.step, step);
        }
    }

    describe "save" {
        it "commits at the expected version and bumps it" {
            let mut manifest = create_test_manifest(&db, user_id);
            let step_id = manifest.steps()[0].id;
            manifest.set_status(step_id, StepStatus::Completed, Utc::now()).expect("Unknown step");

            let outcome = db.save(commit(manifest.clone(), 1)).expect("Save failed");
            assert_eq!(outcome, SaveOutcome::Committed { version: 2 });

            let loaded = db.get_manifest(manifest.tree_id()).expect("Query failed").expect("Tree not found");
            assert_eq!(loaded.version(), 2);
            assert_eq!(loaded.step(step_id).map(|s| s.status), Some(StepStatus::Completed));

            let node = db.get_node(step_id).expect("Query failed").expect("Step not found");
            assert_eq!(node.step.status, StepStatus::Completed);
        }

        it "reports a conflict for a stale version and writes nothing" {
            let manifest = create_test_manifest(&db, user_id);
            db.save(commit(manifest.clone(), 1)).expect("Save failed");

            let mut stale = manifest.clone();
            let step_id = stale.steps()[0].id;
            stale.set_status(step_id, StepStatus::Skipped, Utc::now()).expect("Unknown step");

            let outcome = db.save(commit(stale, 1)).expect("Save failed");
            assert_eq!(outcome, SaveOutcome::Conflict { current_version: 2 });

            let loaded = db.get_manifest(manifest.tree_id()).expect("Query failed").expect("Tree not found");
            assert_eq!(loaded.step(step_id).map(|s| s.status), Some(StepStatus::Pending));
            assert_eq!(db.audit_log(manifest.tree_id()).expect("Query failed").len(), 2);
        }

        it "refuses to save a tree that was never created" {
            let orphan = RoadmapManifest::new(user_id, "Orphan", vec![Phase::new("p", 1)], vec![])
                .expect("Failed to build manifest");
            let result = db.save(commit(orphan, 0));
            assert!(matches!(result, Err(RepositoryError::Consistency { .. })));
        }
    }

    describe "expansion log" {
        it "stores the record with the committed manifest" {
            let manifest = create_test_manifest(&db, user_id);
            let record = ExpansionRecord {
                tree_id: manifest.tree_id(),
                fingerprint: "fp-1".to_string(),
                payload_digest: "digest".to_string(),
                trigger_step_id: manifest.steps()[0].id,
                new_step_ids: vec![Uuid::new_v4()],
                trace_id: Uuid::new_v4(),
                version: 2,
                created_at: Utc::now(),
            };
            let mut change = commit(manifest.clone(), 1);
            change.expansion = Some(record.clone());
            db.save(change).expect("Save failed");

            let found = db.find_expansion(manifest.tree_id(), "fp-1")
                .expect("Query failed")
                .expect("Record not found");
            assert_eq!(found.new_step_ids, record.new_step_ids);
            assert_eq!(found.payload_digest, "digest");
            assert_eq!(found.version, 2);
            assert!(db.find_expansion(manifest.tree_id(), "fp-2").expect("Query failed").is_none());
        }
    }

    describe "audit_log" {
        it "returns records oldest first" {
            let manifest = create_test_manifest(&db, user_id);
            let duplicate = AuditDraft::new(AuditAction::DuplicateCompletion, None, serde_json::json!({}))
                .into_record(manifest.tree_id(), Uuid::new_v4(), "test", 1);
            db.append_audit(duplicate).expect("Append failed");

            let actions: Vec<AuditAction> = db.audit_log(manifest.tree_id())
                .expect("Query failed")
                .into_iter()
                .map(|r| r.action)
                .collect();
            assert_eq!(actions, vec![AuditAction::Created, AuditAction::DuplicateCompletion]);
        }
    }

    describe "engine over sqlite" {
        it "completes a step and keeps rows and manifest in step" {
            let engine = roadmap_engine::Engine::new(
                std::sync::Arc::new(db.clone()),
                roadmap_engine::EngineConfig::without_backoff(),
            );
            let manifest = create_test_manifest(&db, user_id);
            let first = manifest.steps()[0].id;

            let result = tokio_test::block_on(engine.complete(first, user_id, None))
                .expect("Completion failed");
            assert_eq!(result.version, 2);

            let node = db.get_node(first).expect("Query failed").expect("Step not found");
            assert_eq!(node.step.status, StepStatus::Completed);
            assert_eq!(engine.ready_steps(manifest.tree_id()).expect("Query failed").len(), 1);
        }

        it "remembers announced phases across engines" {
            let config = roadmap_engine::EngineConfig::without_backoff();
            let engine = roadmap_engine::Engine::new(std::sync::Arc::new(db.clone()), config.clone());
            let manifest = create_test_manifest(&db, user_id);
            for step in manifest.steps() {
                tokio_test::block_on(engine.complete(step.id, user_id, None))
                    .expect("Completion failed");
            }

            let restarted = roadmap_engine::Engine::new(std::sync::Arc::new(db.clone()), config);
            let status = tokio_test::block_on(restarted.evaluate_phases(manifest.tree_id()))
                .expect("Evaluation failed");
            assert!(status.is_complete("basics"));
            assert!(status.newly_completed.is_empty());

            let announced = db.audit_log(manifest.tree_id())
                .expect("Query failed")
                .into_iter()
                .filter(|r| r.action == AuditAction::PhaseCompleted)
                .collect::<Vec<_>>();
            assert_eq!(announced.len(), 1);
            assert_eq!(announced[0].details["phase_id"], "basics");
            assert_eq!(announced[0].version, 3);
        }
    }

    describe "file database" {
        it "persists across connections" {
            let dir = tempfile::tempdir().expect("Failed to create temp dir");
            let path = dir.path().join("nested").join("roadmap.db");

            let tree_id = {
                let file_db = Database::open(path.clone()).expect("Failed to open");
                file_db.migrate().expect("Failed to migrate");
                create_test_manifest(&file_db, user_id).tree_id()
            };

            let reopened = Database::open(path).expect("Failed to reopen");
            reopened.migrate().expect("Migrations are idempotent");
            let loaded = reopened.get_manifest(tree_id).expect("Query failed").expect("Tree not found");
            assert_eq!(loaded.goal(), "Learn Rust");
        }
    }
}
