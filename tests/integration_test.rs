//! Integration tests for Flotilla
//!
//! These tests verify end-to-end behavior of the scheduler core: task
//! lifecycle, rolling updates, and constraint matching working together.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use flotilla::constraints;
use flotilla::{
    AdminInterface, Attribute, Clock, Driver, EventSink, FakeClock, Identity,
    InMemorySessionValidator, JobConfiguration, LimitConstraint, PubsubEvent, RecordingDriver,
    Resources, ResponseCode, ScheduleStatus, SchedulerConfig, SessionKey, ShardUpdateResult,
    StateManager, TaskConfig, TaskQuery, TransactionalStorage, UpdateCoordinator, UpdateResult,
};

struct Cluster {
    manager: Arc<StateManager>,
    updater: UpdateCoordinator,
    admin: AdminInterface,
    driver: Arc<RecordingDriver>,
    clock: Arc<FakeClock>,
}

fn cluster() -> Cluster {
    let storage = Arc::new(TransactionalStorage::new(EventSink::default()));
    let driver = Arc::new(RecordingDriver::new());
    let clock = Arc::new(FakeClock::new(1_000_000));
    let manager = Arc::new(StateManager::new(
        storage,
        Arc::clone(&driver) as Arc<dyn Driver>,
        Arc::clone(&clock) as Arc<dyn Clock>,
    ));
    let updater = UpdateCoordinator::new(Arc::clone(&manager));
    let validator = Arc::new(
        InMemorySessionValidator::default()
            .with_role_member("r", "u")
            .with_admin("root"),
    );
    let admin = AdminInterface::new(
        SchedulerConfig::default(),
        Arc::clone(&manager),
        validator,
    );
    Cluster {
        manager,
        updater,
        admin,
        driver,
        clock,
    }
}

fn task_config(role: &str, job: &str, shard: u32, ram_mb: u64) -> TaskConfig {
    TaskConfig {
        role: role.to_string(),
        environment: "prod".to_string(),
        job_name: job.to_string(),
        shard_id: shard,
        requested_ports: BTreeSet::from(["http".to_string()]),
        resources: Resources {
            num_cpus: 1.0,
            ram_mb,
            disk_mb: 0,
        },
        constraints: Vec::new(),
        is_service: true,
        max_task_failures: 0,
        executor_config: serde_json::Value::Null,
    }
}

fn identity() -> Identity {
    Identity::new("r", "u")
}

// =============================================================================
// Scenario: create -> assign -> run
// =============================================================================

#[test]
fn test_create_assign_run() {
    let c = cluster();
    let mut events = c.manager.storage().subscribe();

    let ids = c.manager.insert_tasks([task_config("r", "j", 0, 128)]);
    assert_eq!(ids.len(), 1);
    let task_id = ids.iter().next().unwrap().clone();

    let pending = &c.manager.fetch_tasks(&TaskQuery::by_id(&task_id))[0];
    assert_eq!(pending.status, ScheduleStatus::Pending);

    let assigned = c
        .manager
        .assign_task(&task_id, "h1", "s1", BTreeSet::from([31_000]))
        .unwrap();
    assert_eq!(assigned.slave_host.as_deref(), Some("h1"));
    assert_eq!(assigned.slave_id.as_deref(), Some("s1"));
    assert_eq!(assigned.assigned_ports.get("http"), Some(&31_000));

    // TaskStateChange(task, PENDING) published after the assignment commits.
    let mut previous_states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PubsubEvent::TaskStateChange { previous, .. } = event {
            previous_states.push(previous);
        }
    }
    assert_eq!(
        previous_states,
        vec![ScheduleStatus::Init, ScheduleStatus::Pending]
    );

    c.manager
        .change_state(&TaskQuery::by_id(&task_id), ScheduleStatus::Starting, None);
    c.manager
        .change_state(&TaskQuery::by_id(&task_id), ScheduleStatus::Running, None);

    let running = &c.manager.fetch_tasks(&TaskQuery::by_id(&task_id))[0];
    assert_eq!(running.status, ScheduleStatus::Running);
    assert_eq!(running.task_events.len(), 4);
    assert!(running
        .task_events
        .windows(2)
        .all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(running.task_events.last().unwrap().status, running.status);
}

// =============================================================================
// Scenario: rolling update happy path
// =============================================================================

#[test]
fn test_rolling_update_happy_path() {
    let c = cluster();

    // Two running shards with config A (128 MB).
    let ids = c
        .manager
        .insert_tasks([task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)]);
    let original_ids: Vec<String> = ids.into_iter().collect();

    // Register config B (512 MB) and drive both shards.
    let token = c
        .updater
        .register_update(
            "r",
            "j",
            vec![task_config("r", "j", 0, 512), task_config("r", "j", 1, 512)],
        )
        .unwrap();

    let results = c
        .updater
        .update_shards(&identity(), "j", &BTreeSet::from([0, 1]), &token)
        .unwrap();
    assert_eq!(results.get(&0), Some(&ShardUpdateResult::Restarting));
    assert_eq!(results.get(&1), Some(&ShardUpdateResult::Restarting));

    for id in &original_ids {
        assert_eq!(
            c.manager.fetch_tasks(&TaskQuery::by_id(id))[0].status,
            ScheduleStatus::Updating
        );
    }
    assert_eq!(c.driver.killed().len(), 2);

    // The framework confirms both kills; replacements appear with config B.
    c.clock.advance(50);
    for id in &original_ids {
        c.manager
            .change_state(&TaskQuery::by_id(id), ScheduleStatus::Killed, None);
    }

    let replacements = c
        .manager
        .fetch_tasks(&TaskQuery::job_scoped("r", "j").active());
    assert_eq!(replacements.len(), 2);
    for replacement in &replacements {
        assert_eq!(replacement.status, ScheduleStatus::Pending);
        assert_eq!(replacement.config().resources.ram_mb, 512);
        assert!(original_ids
            .contains(&replacement.ancestor_id.clone().unwrap()));
    }

    assert!(c
        .updater
        .finish_update(&identity(), "j", Some(&token), UpdateResult::Success, true)
        .unwrap());
    assert!(c
        .manager
        .storage()
        .read(|s| s.update_store.fetch_job_update_config("r", "j").is_none()));

    // No task is left mid-update after a successful finish.
    assert!(c
        .manager
        .fetch_tasks(&TaskQuery::job_scoped("r", "j").by_status([
            ScheduleStatus::Updating,
            ScheduleStatus::Rollback,
        ]))
        .is_empty());
}

// =============================================================================
// Scenario: update with shard removal
// =============================================================================

#[test]
fn test_update_shrinks_job_on_success() {
    let c = cluster();
    c.manager.insert_tasks([
        task_config("r", "j", 0, 128),
        task_config("r", "j", 1, 128),
        task_config("r", "j", 2, 128),
    ]);

    // The new configuration has shards {0, 1} only.
    let token = c
        .updater
        .register_update(
            "r",
            "j",
            vec![task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)],
        )
        .unwrap();

    let stored = c
        .manager
        .storage()
        .read(|s| s.update_store.fetch_job_update_config("r", "j").cloned())
        .unwrap();
    assert_eq!(stored.configs.len(), 3);
    assert!(stored.shard_config(2).unwrap().new_config.is_none());

    // FAILED keeps the old config: no shard has a null old side, so nothing
    // is killed and the update record is simply removed.
    assert!(c
        .updater
        .finish_update(&identity(), "j", Some(&token), UpdateResult::Failed, true)
        .unwrap());
    assert_eq!(
        c.manager
            .fetch_tasks(&TaskQuery::job_scoped("r", "j").active())
            .len(),
        3
    );

    // Re-register and accept: shard 2 is killed as removed.
    let token = c
        .updater
        .register_update(
            "r",
            "j",
            vec![task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)],
        )
        .unwrap();
    assert!(c
        .updater
        .finish_update(&identity(), "j", Some(&token), UpdateResult::Success, true)
        .unwrap());

    let shard2 = &c.manager.fetch_tasks(&TaskQuery::shard_scoped("r", "j", [2]))[0];
    assert_eq!(shard2.status, ScheduleStatus::Killing);
    assert_eq!(
        shard2.task_events.last().unwrap().message.as_deref(),
        Some("Removed during update by u")
    );

    // The killed shard is not replaced once the kill lands.
    c.manager
        .change_state(&TaskQuery::by_id(shard2.task_id()), ScheduleStatus::Killed, None);
    assert!(c
        .manager
        .fetch_tasks(&TaskQuery::shard_scoped("r", "j", [2]).active())
        .is_empty());
}

// =============================================================================
// Scenario: unrecognized shards are rejected atomically
// =============================================================================

#[test]
fn test_unrecognized_shards_leave_store_unchanged() {
    let c = cluster();
    c.manager
        .insert_tasks([task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)]);

    let token = c
        .updater
        .register_update(
            "r",
            "j",
            vec![task_config("r", "j", 0, 512), task_config("r", "j", 1, 512)],
        )
        .unwrap();

    let err = c
        .updater
        .update_shards(&identity(), "j", &BTreeSet::from([0, 1, 2]), &token)
        .unwrap_err();
    assert!(err.to_string().contains("unrecognized shards"));

    let tasks = c.manager.fetch_tasks(&TaskQuery::job_scoped("r", "j"));
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == ScheduleStatus::Pending));
    assert!(c.driver.killed().is_empty());
}

// =============================================================================
// Scenario: concurrent update guard
// =============================================================================

#[test]
fn test_second_register_update_is_refused() {
    let c = cluster();
    c.manager.insert_tasks([task_config("r", "j", 0, 128)]);

    c.updater
        .register_update("r", "j", vec![task_config("r", "j", 0, 512)])
        .unwrap();
    let err = c
        .updater
        .register_update("r", "j", vec![task_config("r", "j", 0, 1_024)])
        .unwrap_err();
    assert!(err.to_string().contains("Update already in progress"));
}

// =============================================================================
// Scenario: attribute limit constraint
// =============================================================================

#[test]
fn test_limit_constraint_against_cluster_state() {
    let c = cluster();

    // Host attributes live in the attribute store.
    c.manager
        .save_host_attributes("h1", [Attribute::new("rack", ["a".to_string()])]);
    c.manager
        .save_host_attributes("h2", [Attribute::new("rack", ["b".to_string()])]);

    let ids = c.manager.insert_tasks([task_config("r", "j", 0, 128)]);
    let task_id = ids.iter().next().unwrap().clone();
    c.manager
        .assign_task(&task_id, "h1", "s1", BTreeSet::from([31_000]))
        .unwrap();
    c.manager
        .change_state(&TaskQuery::by_id(&task_id), ScheduleStatus::Running, None);

    let active = c.manager.fetch_tasks(&TaskQuery::job_scoped("r", "j").active());
    let storage = Arc::clone(c.manager.storage());
    let loader = move |host: &str| -> BTreeSet<Attribute> {
        storage.read(|s| s.attribute_store.fetch_host_attributes(host))
    };

    let limit = LimitConstraint { limit: 1 };
    let h1_attrs = BTreeSet::from([Attribute::new("rack", ["a".to_string()])]);
    let h2_attrs = BTreeSet::from([Attribute::new("rack", ["b".to_string()])]);

    // h1 already hosts the one allowed task for rack=a; h2 is free.
    assert!(!constraints::matches_limit(
        &h1_attrs, "r", "j", &limit, &active, &loader,
    ));
    assert!(constraints::matches_limit(
        &h2_attrs, "r", "j", &limit, &active, &loader,
    ));
}

// =============================================================================
// Admin facade end to end
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_admin_kill_job_end_to_end() {
    let c = cluster();
    let session = SessionKey::new("u");
    let job = JobConfiguration {
        owner: identity(),
        job_name: "j".to_string(),
        task_configs: vec![task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)],
    };
    assert!(c.admin.create_job(&job, &session).is_ok());

    // Simulate the framework confirming kills shortly after they are issued.
    let manager = Arc::clone(&c.manager);
    let framework = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let killing = manager.fetch_task_ids(
            &TaskQuery::job_scoped("r", "j").by_status([ScheduleStatus::Killing]),
        );
        manager.change_state(&TaskQuery::by_ids(killing), ScheduleStatus::Killed, None);
    });

    let response = c
        .admin
        .kill_tasks(&TaskQuery::job_scoped("r", "j"), &session)
        .await;
    framework.await.unwrap();

    assert_eq!(response.code, ResponseCode::Ok, "{}", response.message);
    assert!(c
        .manager
        .fetch_tasks(&TaskQuery::job_scoped("r", "j").active())
        .is_empty());
    // Both kills reached the driver.
    assert_eq!(c.driver.killed().len(), 2);
}

#[test]
fn test_admin_update_flow_with_added_shard() {
    let c = cluster();
    let session = SessionKey::new("u");
    let job = JobConfiguration {
        owner: identity(),
        job_name: "j".to_string(),
        task_configs: vec![task_config("r", "j", 0, 128)],
    };
    c.admin.create_job(&job, &session);

    // The update grows the job to two shards.
    let updated = JobConfiguration {
        owner: identity(),
        job_name: "j".to_string(),
        task_configs: vec![task_config("r", "j", 0, 128), task_config("r", "j", 1, 128)],
    };
    let token = c.admin.start_update(&updated, &session).result.unwrap();

    let results = c
        .admin
        .update_shards("r", "j", &BTreeSet::from([0, 1]), &token, &session)
        .result
        .unwrap();
    assert_eq!(results.get(&0), Some(&ShardUpdateResult::Unchanged));
    assert_eq!(results.get(&1), Some(&ShardUpdateResult::Added));

    let active = c.manager.fetch_tasks(&TaskQuery::job_scoped("r", "j").active());
    assert_eq!(active.len(), 2);

    let response = c.admin.finish_update("r", "j", UpdateResult::Success, Some(&token), &session);
    assert_eq!(response.code, ResponseCode::Ok, "{}", response.message);
}

// =============================================================================
// Invariants under churn
// =============================================================================

#[test]
fn test_single_active_task_per_shard_through_lifecycle() {
    let c = cluster();
    let ids = c.manager.insert_tasks([task_config("r", "j", 0, 128)]);
    let mut current = ids.iter().next().unwrap().clone();

    // Run the shard through several failures and reschedules.
    for round in 0..3 {
        c.manager
            .assign_task(&current, "h1", "s1", BTreeSet::from([31_000]))
            .unwrap();
        c.manager
            .change_state(&TaskQuery::by_id(&current), ScheduleStatus::Running, None);
        c.clock.advance(10);
        c.manager
            .change_state(&TaskQuery::by_id(&current), ScheduleStatus::Lost, None);

        let active = c
            .manager
            .fetch_tasks(&TaskQuery::shard_scoped("r", "j", [0]).active());
        assert_eq!(active.len(), 1, "round {round}");
        let replacement = &active[0];
        assert_eq!(replacement.ancestor_id.as_deref(), Some(current.as_str()));
        current = replacement.task_id().to_string();
    }

    // Every historical record keeps a consistent audit log.
    for task in c.manager.fetch_tasks(&TaskQuery::job_scoped("r", "j")) {
        assert!(!task.task_events.is_empty());
        assert_eq!(task.task_events.last().unwrap().status, task.status);
    }
}
