// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Startup recovery and orphan reconciliation.

mod common;

use chrono::Utc;

use afk::events::EventKind;
use afk::projects::ConfiguredProjects;
use afk::session::{SessionRecord, SessionState};
use afk::workspace::WorkspaceIsolator;

use common::{branch_exists, commit_file, next_event, wait_for_state, Harness};

fn lookup(h: &Harness) -> ConfiguredProjects {
    let mut projects = ConfiguredProjects::default();
    projects.insert("demo", &h.project);
    projects
}

#[tokio::test]
async fn test_suspended_session_is_resumed_with_token() {
    let h = Harness::new();
    let mut ready = h.bus.subscribe(EventKind::AgentReady);
    let record = h
        .manager
        .create_session("chan-a", "demo", &h.project, true)
        .await
        .unwrap();
    next_event(&mut ready).await;
    h.manager.suspend_all().await;

    let (manager, bus) = h.restart();
    let mut ready = bus.subscribe(EventKind::AgentReady);
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &lookup(&h))
        .await;

    assert_eq!(report.resumed, vec![record.name.clone()]);
    assert!(report.failed.is_empty());
    assert!(report.orphans_removed.is_empty());
    assert!(record.workspace_path.exists());

    let agent = h.runtime.last();
    assert_eq!(agent.working_dir, record.workspace_path);
    assert_eq!(agent.resume_token.as_deref(), Some("tok-1"));
    next_event(&mut ready).await;

    wait_for_state(&manager, "chan-a", SessionState::Idle).await;
    let status = manager.status("chan-a").await.unwrap();
    assert!(status.agent_alive);
    assert!(status.record.verbose);
    assert!(manager.send_to_session("chan-a", "where were we?").await);
}

#[tokio::test]
async fn test_orphan_workspace_removed_referenced_kept() {
    let h = Harness::new();
    let mut ready = h.bus.subscribe(EventKind::AgentReady);
    let live = h
        .manager
        .create_session("chan-a", "demo", &h.project, false)
        .await
        .unwrap();
    next_event(&mut ready).await;

    // A stopped session left behind by a merge conflict
    let conflicted = h
        .manager
        .create_session("chan-b", "demo", &h.project, false)
        .await
        .unwrap();
    std::fs::write(conflicted.workspace_path.join("README.md"), "# session\n").unwrap();
    commit_file(&h.project, "README.md", "# main\n", "main edit");
    assert!(h.manager.complete_session("chan-b").await.is_err());

    h.manager.suspend_all().await;

    // A workspace no persisted session knows about
    let isolator = h.isolator();
    let orphan = h.project.join(".sessions").join("demo-000000-000000");
    isolator
        .create(&h.project, &orphan, "sess/demo-000000-000000")
        .await
        .unwrap();

    let (manager, _bus) = h.restart();
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &lookup(&h))
        .await;

    assert_eq!(report.resumed, vec![live.name.clone()]);
    assert_eq!(report.stopped, vec![conflicted.name.clone()]);
    assert_eq!(report.orphans_removed.len(), 1);
    assert!(report.orphans_removed[0].ends_with("demo-000000-000000"));

    assert!(!orphan.exists());
    assert!(!branch_exists(&h.project, "sess/demo-000000-000000"));
    assert!(live.workspace_path.exists());
    assert!(conflicted.workspace_path.exists());
    assert!(branch_exists(&h.project, &conflicted.branch));

    // The stopped session is registered but has no agent
    let status = manager.status("chan-b").await.unwrap();
    assert_eq!(status.record.state, SessionState::Stopped);
    assert!(!status.agent_alive);
    let agent = h.runtime.agent_in(&live.workspace_path);
    assert_eq!(agent.resume_token.as_deref(), Some("tok-1"));
}

#[tokio::test]
async fn test_missing_workspace_marked_stopped_and_reported() {
    let h = Harness::new();
    let record = SessionRecord {
        channel_id: "chan-x".to_string(),
        name: "demo-991231-235959".to_string(),
        project_name: "demo".to_string(),
        project_root: h.project.clone(),
        workspace_path: h.project.join(".sessions").join("demo-991231-235959"),
        branch: "sess/demo-991231-235959".to_string(),
        resume_token: Some("tok-old".to_string()),
        state: SessionState::Running,
        verbose: false,
        created_at: Utc::now(),
    };
    h.store.upsert(&record).unwrap();

    let (manager, _bus) = h.restart();
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &lookup(&h))
        .await;

    assert!(report.resumed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, record.name);
    assert!(report.failed[0].1.contains("workspace missing"));
    assert_eq!(h.runtime.starts(), 0);

    let status = manager.status("chan-x").await.unwrap();
    assert_eq!(status.record.state, SessionState::Stopped);
    assert_eq!(
        h.store.get("chan-x").unwrap().unwrap().state,
        SessionState::Stopped
    );

    // Discarding it still works
    assert!(manager.stop_session("chan-x").await);
    assert!(h.store.get("chan-x").unwrap().is_none());
}

#[tokio::test]
async fn test_failed_agent_start_does_not_block_others() {
    let h = Harness::new();
    let mut ready = h.bus.subscribe(EventKind::AgentReady);
    for channel in ["chan-a", "chan-b"] {
        h.manager
            .create_session(channel, "demo", &h.project, false)
            .await
            .unwrap();
        next_event(&mut ready).await;
    }
    h.manager.suspend_all().await;

    h.runtime.set_fail(true);
    let (manager, _bus) = h.restart();
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &lookup(&h))
        .await;

    assert!(report.resumed.is_empty());
    assert_eq!(report.failed.len(), 2);
    assert_eq!(manager.session_count(), 2);
    for status in manager.list_sessions().await {
        assert_eq!(status.record.state, SessionState::Stopped);
        assert!(status.record.workspace_path.exists());
    }

    // Once the runtime works again a session can be resumed by hand
    h.runtime.set_fail(false);
    let resumed = manager.resume_session("chan-a").await.unwrap();
    assert_eq!(resumed.state, SessionState::Idle);
}

#[tokio::test]
async fn test_unregistered_project_is_not_resumed() {
    let h = Harness::new();
    let mut ready = h.bus.subscribe(EventKind::AgentReady);
    let record = h
        .manager
        .create_session("chan-a", "demo", &h.project, false)
        .await
        .unwrap();
    next_event(&mut ready).await;
    h.manager.suspend_all().await;

    let (manager, _bus) = h.restart();
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &ConfiguredProjects::default())
        .await;

    assert!(report.resumed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, record.name);
    assert!(report.failed[0].1.contains("project not registered: demo"));
    assert_eq!(h.runtime.starts(), 1);

    // Kept for the user to discard or resume later
    assert!(record.workspace_path.exists());
    assert!(report.orphans_removed.is_empty());
    assert_eq!(
        manager.status("chan-a").await.unwrap().record.state,
        SessionState::Stopped
    );
    assert_eq!(
        h.store.get("chan-a").unwrap().unwrap().state,
        SessionState::Stopped
    );
}

#[tokio::test]
async fn test_project_registered_elsewhere_is_not_resumed() {
    let h = Harness::new();
    let mut ready = h.bus.subscribe(EventKind::AgentReady);
    let record = h
        .manager
        .create_session("chan-a", "demo", &h.project, false)
        .await
        .unwrap();
    next_event(&mut ready).await;
    h.manager.suspend_all().await;

    let elsewhere = common::init_repo(&h.temp.path().join("demo-clone"));
    let mut projects = ConfiguredProjects::default();
    projects.insert("demo", &elsewhere);

    let (manager, _bus) = h.restart();
    let report = manager
        .recover_on_startup(h.store.load_all().unwrap(), &projects)
        .await;

    assert!(report.resumed.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("project demo moved"));
    assert_eq!(h.runtime.starts(), 1);
    assert!(record.workspace_path.exists());
    assert_eq!(
        h.store.get("chan-a").unwrap().unwrap().state,
        SessionState::Stopped
    );
}
