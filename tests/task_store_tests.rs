//! Integration tests for the storage layer.
//!
//! These tests exercise projects, workers, access rows and tasks directly
//! against an in-memory SQLite database.

use task_broker::db::Database;
use task_broker::types::{NewProject, NewTask, Project, ProjectUpdate, TaskResult, TaskStatus};
use task_broker::{BrokerError, ErrorCode};

/// Helper to create a fresh in-memory database for testing.
fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create in-memory database")
}

fn create_project(db: &Database, name: &str, public: bool) -> Project {
    db.create_project(NewProject {
        name: name.to_string(),
        public,
        ..Default::default()
    })
    .expect("Failed to create project")
}

fn code_of(err: anyhow::Error) -> ErrorCode {
    BrokerError::from(err).code
}

mod project_tests {
    use super::*;

    #[test]
    fn create_project_generates_secrets() {
        let db = setup_db();

        let project = create_project(&db, "alpha", false);

        assert!(project.id > 0);
        assert!(!project.secret.is_empty());
        assert!(!project.webhook_secret.is_empty());
        assert_ne!(project.secret, project.webhook_secret);
        assert!(!project.paused);
        assert!(project.created_at > 0);
    }

    #[test]
    fn duplicate_name_is_a_duplicate_key() {
        let db = setup_db();
        create_project(&db, "alpha", false);

        let err = db
            .create_project(NewProject {
                name: "alpha".to_string(),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::DuplicateKey);
    }

    #[test]
    fn hidden_project_cannot_be_public() {
        let db = setup_db();

        let err = db
            .create_project(NewProject {
                name: "both".to_string(),
                public: true,
                hidden: true,
                ..Default::default()
            })
            .unwrap_err();

        let err = BrokerError::from(err);
        assert_eq!(err.code, ErrorCode::InvalidSpec);
        assert_eq!(err.field.as_deref(), Some("hidden"));
    }

    #[test]
    fn negative_rate_is_rejected() {
        let db = setup_db();

        let err = db
            .create_project(NewProject {
                name: "fast".to_string(),
                submit_rate: -1.0,
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
    }

    #[test]
    fn chain_target_must_exist() {
        let db = setup_db();

        let err = db
            .create_project(NewProject {
                name: "chained".to_string(),
                chain_target_id: Some(999),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
    }

    #[test]
    fn project_cannot_chain_to_itself() {
        let db = setup_db();
        let project = create_project(&db, "loop", false);

        let err = db
            .update_project(
                project.id,
                ProjectUpdate {
                    name: "loop".to_string(),
                    chain_target_id: Some(project.id),
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
    }

    #[test]
    fn update_project_replaces_fields() {
        let db = setup_db();
        let project = create_project(&db, "alpha", false);
        let target = create_project(&db, "beta", false);

        let updated = db
            .update_project(
                project.id,
                ProjectUpdate {
                    name: "alpha2".to_string(),
                    priority: 5,
                    motd: "hello".to_string(),
                    public: true,
                    chain_target_id: Some(target.id),
                    paused: true,
                    assign_rate: 2.5,
                    ..Default::default()
                },
            )
            .expect("Failed to update project");

        assert_eq!(updated.name, "alpha2");
        assert_eq!(updated.priority, 5);
        assert_eq!(updated.motd, "hello");
        assert!(updated.public);
        assert!(updated.paused);
        assert_eq!(updated.chain_target_id, Some(target.id));
        assert_eq!(updated.assign_rate, 2.5);
        // Secrets survive updates
        assert_eq!(updated.secret, project.secret);
    }

    #[test]
    fn update_unknown_project_is_not_found() {
        let db = setup_db();

        let err = db
            .update_project(
                42,
                ProjectUpdate {
                    name: "ghost".to_string(),
                    ..Default::default()
                },
            )
            .unwrap_err();

        assert_eq!(code_of(err), ErrorCode::NotFound);
    }

    #[test]
    fn set_project_version_matches_repo_case_insensitively() {
        let db = setup_db();
        let project = db
            .create_project(NewProject {
                name: "repo".to_string(),
                repo_identifier: "Owner/Repo".to_string(),
                ..Default::default()
            })
            .expect("Failed to create project");

        let bumped = db
            .set_project_version("owner/repo", "abc123")
            .expect("Failed to set version")
            .expect("Project should match");

        assert_eq!(bumped.id, project.id);
        assert_eq!(bumped.version, "abc123");
        assert!(db.set_project_version("other/repo", "x").unwrap().is_none());
    }

    #[test]
    fn list_projects_in_id_order() {
        let db = setup_db();
        create_project(&db, "a", false);
        create_project(&db, "b", true);

        let names: Vec<_> = db.list_projects().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}

mod worker_tests {
    use super::*;

    #[test]
    fn create_worker_with_alias() {
        let db = setup_db();

        let worker = db
            .create_worker(Some("builder".to_string()))
            .expect("Failed to create worker");

        assert_eq!(worker.alias.as_deref(), Some("builder"));
        assert!(!worker.secret.is_empty());
        assert!(!worker.paused);

        let fetched = db.get_worker(worker.id).unwrap().expect("Worker should exist");
        assert_eq!(fetched.secret, worker.secret);
    }

    #[test]
    fn reserved_alias_is_rejected() {
        let db = setup_db();

        let err = db.create_worker(Some("unassigned".to_string())).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
    }

    #[test]
    fn update_worker_sets_paused() {
        let db = setup_db();
        let worker = db.create_worker(None).unwrap();

        let updated = db
            .update_worker(worker.id, Some("renamed".to_string()), true)
            .expect("Failed to update worker");

        assert!(updated.paused);
        assert_eq!(updated.alias.as_deref(), Some("renamed"));

        let err = db.update_worker(999, None, false).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::NotFound);
    }
}

mod access_tests {
    use super::*;

    #[test]
    fn request_needs_a_flag() {
        let db = setup_db();
        let project = create_project(&db, "p", false);
        let worker = db.create_worker(None).unwrap();

        let err = db
            .insert_access_request(worker.id, project.id, false, false)
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
    }

    #[test]
    fn request_for_unknown_project_is_not_found() {
        let db = setup_db();
        let worker = db.create_worker(None).unwrap();

        let err = db.insert_access_request(worker.id, 77, true, true).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::NotFound);
    }

    #[test]
    fn request_is_pending_until_accepted() {
        let db = setup_db();
        let project = create_project(&db, "p", false);
        let worker = db.create_worker(None).unwrap();

        assert!(db.insert_access_request(worker.id, project.id, true, false).unwrap());
        // A second request for the same pair changes nothing
        assert!(!db.insert_access_request(worker.id, project.id, true, true).unwrap());

        let pending = db.pending_requests(project.id).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].can_assign);
        assert!(!pending[0].can_submit);

        assert!(db.accept_access_request(worker.id, project.id).unwrap());
        assert!(!db.accept_access_request(worker.id, project.id).unwrap());
        assert!(db.pending_requests(project.id).unwrap().is_empty());

        let access = db.get_access(worker.id, project.id).unwrap().expect("row exists");
        assert!(!access.pending_request);
    }

    #[test]
    fn reject_deletes_the_row() {
        let db = setup_db();
        let project = create_project(&db, "p", false);
        let worker = db.create_worker(None).unwrap();

        db.insert_access_request(worker.id, project.id, true, true).unwrap();
        assert!(db.delete_access(worker.id, project.id).unwrap());
        assert!(!db.delete_access(worker.id, project.id).unwrap());
        assert!(db.get_access(worker.id, project.id).unwrap().is_none());
        assert!(db.list_access(project.id).unwrap().is_empty());
    }
}

mod task_tests {
    use super::*;

    #[test]
    fn create_task_starts_new_and_unassigned() {
        let db = setup_db();
        let project = create_project(&db, "p", false);

        let id = db
            .create_task(
                &NewTask::new(project.id, "{\"cmd\":\"build\"}")
                    .with_priority(3)
                    .with_max_retries(2)
                    .with_max_assign_time(60),
            )
            .expect("Failed to create task");

        let task = db.get_task(id).unwrap().expect("Task should exist");
        assert_eq!(task.project_id, project.id);
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.assignee, None);
        assert_eq!(task.assign_time, None);
        assert_eq!(task.retries, 0);
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.priority, 3);
        assert_eq!(task.max_assign_time, 60);
    }

    #[test]
    fn create_task_for_unknown_project_is_not_found() {
        let db = setup_db();

        let err = db.create_task(&NewTask::new(5, "x")).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::NotFound);
    }

    #[test]
    fn invalid_task_is_rejected_before_storage() {
        let db = setup_db();
        let project = create_project(&db, "p", false);

        let err = db
            .create_task(&NewTask::new(project.id, "x").with_hash64(1).with_unique_string("a"))
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::InvalidSpec);
        assert!(db.list_tasks(project.id).unwrap().is_empty());
    }

    #[test]
    fn duplicate_hash_is_rejected_per_project() {
        let db = setup_db();
        let project = create_project(&db, "p", false);
        let other = create_project(&db, "q", false);

        db.create_task(&NewTask::new(project.id, "a").with_hash64(1234)).unwrap();

        let err = db
            .create_task(&NewTask::new(project.id, "b").with_hash64(1234))
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::DuplicateKey);

        // A distinct key in the same project still succeeds
        db.create_task(&NewTask::new(project.id, "c").with_hash64(5678)).unwrap();
        // The same key in another project is fine
        db.create_task(&NewTask::new(other.id, "d").with_hash64(1234)).unwrap();

        assert_eq!(db.list_tasks(project.id).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_unique_string_is_rejected() {
        let db = setup_db();
        let project = create_project(&db, "p", false);

        db.create_task(&NewTask::new(project.id, "a").with_unique_string("job-1")).unwrap();

        let err = db
            .create_task(&NewTask::new(project.id, "b").with_unique_string("job-1"))
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::DuplicateKey);

        db.create_task(&NewTask::new(project.id, "c").with_unique_string("job-2")).unwrap();
        // Tasks without a key never collide
        db.create_task(&NewTask::new(project.id, "d")).unwrap();
        db.create_task(&NewTask::new(project.id, "e")).unwrap();
    }

    #[test]
    fn bulk_create_is_all_or_nothing() {
        let db = setup_db();
        let project = create_project(&db, "p", false);
        db.create_task(&NewTask::new(project.id, "existing").with_hash64(9)).unwrap();

        let batch = vec![
            NewTask::new(project.id, "one").with_hash64(1),
            NewTask::new(project.id, "two").with_hash64(9),
            NewTask::new(project.id, "three").with_hash64(3),
        ];
        let err = db.create_tasks_bulk(&batch).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::DuplicateKey);
        assert_eq!(db.list_tasks(project.id).unwrap().len(), 1);

        let ids = db
            .create_tasks_bulk(&[
                NewTask::new(project.id, "one").with_hash64(1),
                NewTask::new(project.id, "three").with_hash64(3),
            ])
            .expect("Failed to create batch");
        assert_eq!(ids.len(), 2);
        assert!(ids[0] < ids[1]);
        assert_eq!(db.list_tasks(project.id).unwrap().len(), 3);
    }

    #[test]
    fn bulk_create_requires_a_single_project() {
        let db = setup_db();
        let p = create_project(&db, "p", false);
        let q = create_project(&db, "q", false);

        let err = db
            .create_tasks_bulk(&[NewTask::new(p.id, "a"), NewTask::new(q.id, "b")])
            .unwrap_err();
        assert_eq!(code_of(err), ErrorCode::InvalidSpec);

        let err = db.create_tasks_bulk(&[]).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::InvalidSpec);

        assert!(db.list_tasks(p.id).unwrap().is_empty());
        assert!(db.list_tasks(q.id).unwrap().is_empty());
    }

    #[test]
    fn reset_failed_only_touches_failed_tasks() {
        let db = setup_db();
        let project = create_project(&db, "p", true);
        let worker = db.create_worker(None).unwrap();

        let failing = db.create_task(&NewTask::new(project.id, "a").with_priority(1)).unwrap();
        let open = db.create_task(&NewTask::new(project.id, "b")).unwrap();

        // max_retries = 0: the first failure is final
        assert_eq!(db.claim_task(worker.id, project.id, 100).unwrap(), Some(failing));
        assert!(db.release_task(failing, worker.id, TaskResult::Fail, 0).unwrap());
        assert_eq!(db.get_task(failing).unwrap().unwrap().status, TaskStatus::Failed);
        assert_eq!(db.get_tasks_by_status(project.id, TaskStatus::Failed).unwrap().len(), 1);

        assert_eq!(db.reset_failed(project.id).unwrap(), 1);

        let task = db.get_task(failing).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.retries, 0);
        assert_eq!(task.assignee, None);
        assert_eq!(db.get_task(open).unwrap().unwrap().status, TaskStatus::New);

        assert_eq!(db.reset_failed(project.id).unwrap(), 0);
    }

    #[test]
    fn hard_reset_deletes_every_task_of_the_project() {
        let db = setup_db();
        let project = create_project(&db, "p", true);
        let other = create_project(&db, "q", true);
        let worker = db.create_worker(None).unwrap();

        db.create_task(&NewTask::new(project.id, "a").with_verification_count(2)).unwrap();
        db.create_task(&NewTask::new(project.id, "b")).unwrap();
        db.create_task(&NewTask::new(other.id, "c")).unwrap();

        // One assigned task with a verification record
        let claimed = db.claim_task(worker.id, project.id, 100).unwrap().unwrap();
        assert!(!db.release_task(claimed, worker.id, TaskResult::Ok, 7).unwrap());
        db.claim_task(worker.id, project.id, 100).unwrap();

        assert_eq!(db.hard_reset(project.id).unwrap(), 2);
        assert!(db.list_tasks(project.id).unwrap().is_empty());
        assert_eq!(db.list_tasks(other.id).unwrap().len(), 1);
    }

    #[test]
    fn project_stats_count_statuses_and_assignees() {
        let db = setup_db();
        let project = create_project(&db, "p", true);
        let w1 = db.create_worker(None).unwrap();
        let w2 = db.create_worker(None).unwrap();

        for i in 0..4 {
            db.create_task(&NewTask::new(project.id, format!("t{i}"))).unwrap();
        }

        let closed = db.claim_task(w1.id, project.id, 1).unwrap().unwrap();
        db.release_task(closed, w1.id, TaskResult::Ok, 0).unwrap();
        let failed = db.claim_task(w1.id, project.id, 1).unwrap().unwrap();
        db.release_task(failed, w1.id, TaskResult::Fail, 0).unwrap();
        db.claim_task(w1.id, project.id, 1).unwrap().unwrap();
        db.claim_task(w2.id, project.id, 1).unwrap().unwrap();

        let stats = db.project_stats(project.id).expect("Failed to get stats");
        assert_eq!(stats.new_task_count, 2);
        assert_eq!(stats.failed_task_count, 1);
        assert_eq!(stats.closed_task_count, 1);
        assert_eq!(stats.assignees.len(), 2);
        assert!(stats.assignees.iter().all(|a| a.task_count == 1));

        let err = db.project_stats(999).unwrap_err();
        assert_eq!(code_of(err), ErrorCode::NotFound);
    }
}
