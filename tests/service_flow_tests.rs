//! End-to-end flows through the application services.

use serde_json::json;
use taskhub_server::context::{ContextLevel, ContextUpdate};
use taskhub_server::error::ErrorCode;
use taskhub_server::notifications::{EntityType, EventType};
use taskhub_server::services::Services;
use taskhub_server::types::{NewSubtask, NewTask, ProjectUpdate, SubtaskUpdate, TaskStatus, TaskUpdate};

fn setup() -> Services {
    Services::in_memory().expect("Failed to create services")
}

struct Tree {
    project_id: String,
    branch_id: String,
    task_id: String,
}

fn tree(services: &Services, user: &str) -> Tree {
    let project = services.projects.create(user, "alpha", None, None).unwrap();
    let branch = services
        .branches
        .create(user, &project.id, "main", None, None)
        .unwrap();
    let task = services
        .tasks
        .create(
            user,
            NewTask {
                branch_id: branch.id.clone(),
                title: "ship it".into(),
                ..Default::default()
            },
        )
        .unwrap();
    Tree {
        project_id: project.id,
        branch_id: branch.id,
        task_id: task.id,
    }
}

mod progress_tests {
    use super::*;

    #[test]
    fn subtasks_drive_parent_progress_and_gate_completion() {
        let services = setup();
        let t = tree(&services, "u1");
        let a = services
            .subtasks
            .create("u1", &t.task_id, NewSubtask { title: "a".into(), ..Default::default() })
            .unwrap();
        let b = services
            .subtasks
            .create("u1", &t.task_id, NewSubtask { title: "b".into(), ..Default::default() })
            .unwrap();

        services.subtasks.complete("u1", &t.task_id, &a.id, Some("done")).unwrap();
        let task = services.tasks.get("u1", &t.task_id).unwrap();
        assert_eq!(task.progress_percentage, 50);
        assert_ne!(task.status, TaskStatus::Done);

        let err = services.tasks.complete("u1", &t.task_id, None, None).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        services
            .subtasks
            .update(
                "u1",
                &t.task_id,
                &b.id,
                &SubtaskUpdate {
                    status: Some(TaskStatus::Done),
                    ..Default::default()
                },
            )
            .unwrap();
        let task = services.tasks.get("u1", &t.task_id).unwrap();
        assert_eq!(task.progress_percentage, 100);
        // Full progress alone does not finish the task.
        assert_ne!(task.status, TaskStatus::Done);

        let done = services
            .tasks
            .complete("u1", &t.task_id, Some("all green"), Some("cargo test"))
            .unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.completion_summary.as_deref(), Some("all green"));
    }

    #[test]
    fn reopened_task_must_finish_its_new_subtasks() {
        let services = setup();
        let t = tree(&services, "u1");
        services.tasks.complete("u1", &t.task_id, None, None).unwrap();

        let extra = services
            .subtasks
            .create("u1", &t.task_id, NewSubtask { title: "hotfix".into(), ..Default::default() })
            .unwrap();
        assert_eq!(services.tasks.get("u1", &t.task_id).unwrap().status, TaskStatus::InProgress);

        let mark_done = TaskUpdate {
            status: Some(TaskStatus::Done),
            ..Default::default()
        };
        let err = services.tasks.update("u1", &t.task_id, &mark_done).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);

        services.subtasks.complete("u1", &t.task_id, &extra.id, None).unwrap();
        let done = services.tasks.update("u1", &t.task_id, &mark_done).unwrap();
        assert_eq!(done.status, TaskStatus::Done);
        assert_eq!(done.progress_percentage, 100);
    }

    #[test]
    fn manual_progress_starts_work() {
        let services = setup();
        let t = tree(&services, "u1");
        let task = services
            .progress
            .update_progress("u1", &t.task_id, 140, Some("over-reported"))
            .unwrap();
        assert_eq!(task.progress_percentage, 100);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.progress_history.last().unwrap().notes.as_deref(), Some("over-reported"));
    }
}

mod context_tests {
    use super::*;

    #[test]
    fn task_context_inherits_project_settings() {
        let services = setup();
        let t = tree(&services, "u1");
        let contexts = &services.contexts;

        contexts
            .create("u1", ContextLevel::Project, &t.project_id, Some(json!({"review": "required"})))
            .unwrap();
        contexts
            .create("u1", ContextLevel::Task, &t.task_id, Some(json!({"estimate": "2d"})))
            .unwrap();

        let resolved = contexts.resolve("u1", ContextLevel::Task, &t.task_id, false).unwrap();
        assert_eq!(resolved.resolved["review"], "required");
        assert_eq!(resolved.resolved["estimate"], "2d");
        assert!(resolved.chain.contains(&format!("branch:{}", t.branch_id)));
    }

    #[test]
    fn branch_update_reaches_cached_task_resolution() {
        let services = setup();
        let t = tree(&services, "u1");
        let contexts = &services.contexts;
        contexts.create("u1", ContextLevel::Task, &t.task_id, None).unwrap();
        contexts.resolve("u1", ContextLevel::Task, &t.task_id, false).unwrap();

        contexts
            .update(
                "u1",
                ContextLevel::Branch,
                &t.branch_id,
                ContextUpdate {
                    data: Some(json!({"reviewer": "sam"})),
                    merge: true,
                    ..Default::default()
                },
            )
            .unwrap();

        let resolved = contexts.resolve("u1", ContextLevel::Task, &t.task_id, false).unwrap();
        assert_eq!(resolved.source, "computed");
        assert_eq!(resolved.resolved["reviewer"], "sam");
    }

    #[test]
    fn deleting_a_project_drops_its_contexts() {
        let services = setup();
        let t = tree(&services, "u1");
        services
            .contexts
            .create("u1", ContextLevel::Task, &t.task_id, Some(json!({"k": 1})))
            .unwrap();

        let report = services.projects.delete("u1", &t.project_id).unwrap();
        assert_eq!(report.task_contexts, 1);

        let err = services
            .contexts
            .get("u1", ContextLevel::Project, &t.project_id)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextNotFound);
        let err = services
            .contexts
            .resolve("u1", ContextLevel::Task, &t.task_id, false)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ContextNotFound);
    }

    #[test]
    fn approved_delegation_lands_in_project_context() {
        let services = setup();
        let t = tree(&services, "u1");
        let contexts = &services.contexts;

        let delegation = contexts
            .delegate(
                "u1",
                ContextLevel::Task,
                &t.task_id,
                ContextLevel::Project,
                json!({"pattern": "retry with backoff"}),
                "reusable",
            )
            .unwrap();
        let processed = contexts.process_delegation("u1", &delegation.id, true).unwrap();
        assert_eq!(processed.status.as_str(), "approved");

        let project = contexts.get("u1", ContextLevel::Project, &t.project_id).unwrap();
        assert_eq!(project.data["pattern"], "retry with backoff");

        let err = contexts.process_delegation("u1", &delegation.id, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidState);
    }
}

mod notification_tests {
    use super::*;

    #[test]
    fn mutations_publish_change_events() {
        let services = setup();
        let mut rx = services.notifications.subscribe();
        let t = tree(&services, "u1");

        let project = rx.try_recv().unwrap();
        assert_eq!(project.event_type, EventType::Created);
        assert_eq!(project.entity_type, EntityType::Project);
        assert_eq!(project.entity_id, t.project_id);

        let branch = rx.try_recv().unwrap();
        assert_eq!(branch.entity_type, EntityType::Branch);
        assert_eq!(branch.project_id.as_deref(), Some(t.project_id.as_str()));

        let task = rx.try_recv().unwrap();
        assert_eq!(task.entity_type, EntityType::Task);
        assert_eq!(task.branch_id.as_deref(), Some(t.branch_id.as_str()));
        assert_eq!(task.project_id.as_deref(), Some(t.project_id.as_str()));
    }

    #[test]
    fn repeated_updates_are_deduplicated() {
        let services = setup();
        let t = tree(&services, "u1");
        let mut rx = services.notifications.subscribe();

        for name in ["beta", "gamma", "delta"] {
            services
                .projects
                .update(
                    "u1",
                    &t.project_id,
                    &ProjectUpdate {
                        name: Some(name.into()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let first = rx.try_recv().unwrap();
        assert_eq!(first.event_type, EventType::Updated);
        assert!(rx.try_recv().is_err());
        assert_eq!(services.notifications.stats().suppressed, 2);
        assert_eq!(services.projects.get("u1", &t.project_id).unwrap().name, "delta");
    }
}
