mod common;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use pretty_assertions::assert_eq;
use serde_json::json;
use stackpilot::{
    builder::{container::ContainerSpecBuilder, Builder, Configuration, IntegrationTarget},
    container::{Lifecycle, Provisioned},
    detect::{HypervisorClass, RuntimeBackend},
    driver::{Driver, RunOutcome, Step},
    merge::ServerEntry,
    progress::{FileProgressStore, InstallMode, InstallStage, MemoryProgressStore, ProgressStore, STAGE_FILE},
    resume::{Registrar, RunAs, Trigger},
};

use common::{FakeHost, FakeRuntime, FakeScheduler, FixedProbe};

const ENTRY_POINT: &str = "C:\\StackPilot\\stackpilot.exe";

fn config(state_dir: &Path) -> Configuration {
    let qdrant = ContainerSpecBuilder::new()
        .with_name("qdrant".to_string())
        .with_image("qdrant/qdrant:latest".to_string())
        .with_port(6333, 6333)
        .with_health_url("http://localhost:6333/healthz")
        .try_build()
        .unwrap();
    Configuration::new(PathBuf::from(ENTRY_POINT))
        .with_state_dir(state_dir.to_path_buf())
        .with_container(qdrant)
        .with_runtime_wait(Duration::from_secs(180), Duration::from_secs(5))
}

#[tokio::test]
async fn test_fresh_hyperv_guest_suspends_for_feature_reboot() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost::new(false, false);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::HyperV,
    );
    let outcome = driver.run(InstallMode::Unattended).await;

    assert_eq!(
        outcome,
        RunOutcome::Rebooting {
            stage: InstallStage::AwaitingVirtualizationFeatureReboot,
            mode: InstallMode::Unattended,
        }
    );
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(
        store.snapshot(),
        Some((
            InstallStage::AwaitingVirtualizationFeatureReboot,
            InstallMode::Unattended
        ))
    );

    let tasks = scheduler.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].trigger, Trigger::AtBoot);
    assert_eq!(tasks[0].run_as, RunAs::System);
    assert_eq!(tasks[0].program, PathBuf::from(ENTRY_POINT));
    assert_eq!(tasks[0].arguments, vec!["install", "--unattended"]);

    assert_eq!(
        host.calls(),
        vec![
            "ensure_package_manager",
            "virtualization_feature_enabled",
            "enable_virtualization_feature",
            "reboot",
        ]
    );
    assert_eq!(*host.reboots.lock().unwrap(), vec![Duration::from_secs(10)]);
    assert_eq!(runtime.state.lock().unwrap().live_polls, 0);
}

#[tokio::test]
async fn test_resume_task_carries_the_invocation_options() {
    let state = tempfile::tempdir().unwrap();
    let state_dir = state.path().display().to_string();
    let integration = "C:\\Users\\ada\\AppData\\Roaming\\Claude\\claude_desktop_config.json".to_string();
    let host = FakeHost::new(true, false);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path())
            .with_resume_argument("--state-dir", state_dir.clone())
            .with_resume_argument("--integration-config", integration.clone()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::HyperV,
    );
    let outcome = driver.run(InstallMode::Unattended).await;

    assert_eq!(
        outcome,
        RunOutcome::Rebooting {
            stage: InstallStage::AwaitingRuntimeInstallReboot,
            mode: InstallMode::Unattended,
        }
    );
    let tasks = scheduler.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(
        tasks[0].arguments,
        vec![
            "install".to_string(),
            "--unattended".to_string(),
            "--state-dir".to_string(),
            state_dir,
            "--integration-config".to_string(),
            integration,
        ]
    );
}

#[tokio::test]
async fn test_resumes_from_persisted_runtime_stage_in_persisted_mode() {
    let state = tempfile::tempdir().unwrap();
    FileProgressStore::new(state.path())
        .save(InstallStage::AwaitingRuntimeInstallReboot, InstallMode::Unattended)
        .unwrap();

    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::new();
    let scheduler = FakeScheduler::default();
    let registrar = Registrar::new(&scheduler);
    registrar
        .arm(Path::new(ENTRY_POINT), InstallMode::Unattended, &[])
        .await
        .unwrap();

    // A fresh invocation without flags
    let store = FileProgressStore::new(state.path());
    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        registrar,
        HypervisorClass::HyperV,
    );
    let outcome = driver.run(InstallMode::default()).await;

    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {:?}", other),
    };
    assert_eq!(summary.mode, InstallMode::Unattended);
    assert_eq!(summary.resumed_from, Some(InstallStage::AwaitingRuntimeInstallReboot));
    assert_eq!(summary.containers.len(), 1);
    assert_eq!(summary.containers[0].action, Provisioned::Created);
    assert!(summary.warnings.is_empty());

    // Nothing before waiting for the runtime ran again
    assert_eq!(host.calls(), vec!["start_runtime"]);
    assert_eq!(store.load().unwrap(), None);
    assert_eq!(scheduler.folder_count(), 0);
}

#[tokio::test]
async fn test_full_install_across_two_reboots() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost::new(false, false);
    let runtime = FakeRuntime::new();
    let scheduler = FakeScheduler::default();
    let store = FileProgressStore::new(state.path());

    let invoke = |mode| {
        let driver = Driver::new(
            config(state.path()),
            &host,
            Lifecycle::new(&runtime, FixedProbe(true)),
            &store,
            Registrar::new(&scheduler),
            HypervisorClass::HyperV,
        );
        async move { driver.run(mode).await }
    };

    let first = invoke(InstallMode::Unattended).await;
    assert!(matches!(
        first,
        RunOutcome::Rebooting {
            stage: InstallStage::AwaitingVirtualizationFeatureReboot,
            ..
        }
    ));

    let second = invoke(InstallMode::Interactive).await;
    assert_eq!(
        second,
        RunOutcome::Rebooting {
            stage: InstallStage::AwaitingRuntimeInstallReboot,
            mode: InstallMode::Unattended,
        }
    );
    assert_eq!(*host.backends.lock().unwrap(), vec![RuntimeBackend::HyperV]);
    assert_eq!(scheduler.tasks().len(), 1);

    let third = invoke(InstallMode::Interactive).await;
    assert!(matches!(third, RunOutcome::Completed(_)));
    assert_eq!(third.exit_code(), 0);
    assert_eq!(store.load().unwrap(), None);
    assert_eq!(scheduler.folder_count(), 0);

    let calls = host.calls();
    assert_eq!(calls.iter().filter(|c| *c == "ensure_package_manager").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "install_prerequisites").count(), 1);
    assert_eq!(calls.iter().filter(|c| *c == "reboot").count(), 2);
}

#[tokio::test]
async fn test_non_hyperv_guest_skips_feature_and_uses_default_backend() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost::new(false, false);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::VMware,
    );
    let outcome = driver.run(InstallMode::Interactive).await;

    assert_eq!(
        outcome,
        RunOutcome::Rebooting {
            stage: InstallStage::AwaitingRuntimeInstallReboot,
            mode: InstallMode::Interactive,
        }
    );
    assert!(!host.calls().iter().any(|c| c.contains("virtualization")));
    assert_eq!(*host.backends.lock().unwrap(), vec![RuntimeBackend::Default]);
    assert_eq!(*host.reboots.lock().unwrap(), vec![Duration::from_secs(60)]);

    let tasks = scheduler.tasks();
    assert_eq!(tasks[0].trigger, Trigger::AtLogon);
    assert_eq!(tasks[0].run_as, RunAs::CurrentUser);
    assert_eq!(tasks[0].arguments, vec!["install"]);
}

#[tokio::test]
async fn test_resume_task_failure_still_reboots() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost::new(false, false);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::failing();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::HyperV,
    );
    let outcome = driver.run(InstallMode::Unattended).await;

    assert!(matches!(outcome, RunOutcome::Rebooting { .. }));
    assert!(store.snapshot().is_some());
    assert!(scheduler.tasks().is_empty());
    assert_eq!(host.reboots.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_runtime_never_live_fails_and_keeps_progress() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::never_live();
    let store = MemoryProgressStore::with_saved(
        InstallStage::AwaitingRuntimeInstallReboot,
        InstallMode::Interactive,
    );
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::HyperV,
    );
    let start = tokio::time::Instant::now();
    let outcome = driver.run(InstallMode::Interactive).await;

    let failure = match &outcome {
        RunOutcome::Failed(failure) => failure.clone(),
        other => panic!("expected a failure, got {:?}", other),
    };
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(failure.step, Some(Step::WaitForRuntime));
    assert!(failure.hint.contains("docker info"));
    assert!(failure.hint.contains("stackpilot.log"));
    assert!(start.elapsed() >= Duration::from_secs(180));
    assert_eq!(
        store.snapshot(),
        Some((
            InstallStage::AwaitingRuntimeInstallReboot,
            InstallMode::Interactive
        ))
    );
    assert_eq!(runtime.state.lock().unwrap().creates, 0);
}

#[tokio::test]
async fn test_corrupt_progress_is_fatal() {
    let state = tempfile::tempdir().unwrap();
    fs::write(state.path().join(STAGE_FILE), "HalfwayThere").unwrap();
    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        FileProgressStore::new(state.path()),
        Registrar::new(&scheduler),
        HypervisorClass::None,
    );
    let outcome = driver.run(InstallMode::Interactive).await;

    match outcome {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.step, None);
            assert!(failure.hint.contains("stackpilot reset"));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_prerequisite_failure_is_fatal() {
    let state = tempfile::tempdir().unwrap();
    let host = FakeHost {
        fail_prerequisites: true,
        ..FakeHost::new(true, true)
    };
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::HyperV,
    );
    let outcome = driver.run(InstallMode::Interactive).await;

    assert!(
        matches!(&outcome, RunOutcome::Failed(f) if f.step == Some(Step::InstallPrerequisites))
    );
    assert!(!host.calls().contains(&"runtime_installed".to_string()));
}

#[tokio::test]
async fn test_container_failure_fails_after_trying_every_container() {
    let state = tempfile::tempdir().unwrap();
    let crawler = ContainerSpecBuilder::new()
        .with_name("crawl4ai".to_string())
        .with_image("unclecode/crawl4ai:latest".to_string())
        .with_port(11235, 11235)
        .try_build()
        .unwrap();
    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::new().with_broken("qdrant");
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()).with_container(crawler),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::None,
    );
    let outcome = driver.run(InstallMode::Interactive).await;

    match outcome {
        RunOutcome::Failed(failure) => {
            assert_eq!(failure.step, Some(Step::EnsureContainers));
            assert!(failure.reason.contains("qdrant"));
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    assert!(runtime.state.lock().unwrap().containers.contains_key("crawl4ai"));
}

#[tokio::test(start_paused = true)]
async fn test_degraded_health_and_bad_integration_file_are_warnings() {
    let state = tempfile::tempdir().unwrap();
    let integration_path = state.path().join("claude_desktop_config.json");
    fs::write(&integration_path, "{ not json").unwrap();

    let target = IntegrationTarget::new(integration_path.clone()).with_entry(
        "rag-store".to_string(),
        ServerEntry {
            command: Some("uvx".to_string()),
            ..ServerEntry::default()
        },
    );
    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()).with_integration(target),
        &host,
        Lifecycle::new(&runtime, FixedProbe(false)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::None,
    );
    let outcome = driver.run(InstallMode::Interactive).await;

    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {:?}", other),
    };
    assert_eq!(summary.warnings.len(), 2);
    assert!(summary.merge.is_none());
    assert_eq!(fs::read_to_string(&integration_path).unwrap(), "{ not json");
}

#[tokio::test]
async fn test_merges_integration_entries_on_completion() {
    let state = tempfile::tempdir().unwrap();
    let integration_path = state.path().join("claude_desktop_config.json");
    fs::write(
        &integration_path,
        json!({"theme": "dark", "mcpServers": {"rag-store": {"command": "mine"}}}).to_string(),
    )
    .unwrap();

    let target = IntegrationTarget::new(integration_path.clone())
        .with_entry(
            "rag-store".to_string(),
            ServerEntry {
                command: Some("uvx".to_string()),
                ..ServerEntry::default()
            },
        )
        .with_entry(
            "crawl4ai".to_string(),
            ServerEntry {
                url: Some("http://localhost:11235/mcp/sse".to_string()),
                ..ServerEntry::default()
            },
        );
    let host = FakeHost::new(true, true);
    let runtime = FakeRuntime::new();
    let store = MemoryProgressStore::new();
    let scheduler = FakeScheduler::default();

    let driver = Driver::new(
        config(state.path()).with_integration(target),
        &host,
        Lifecycle::new(&runtime, FixedProbe(true)),
        &store,
        Registrar::new(&scheduler),
        HypervisorClass::None,
    );
    let summary = match driver.run(InstallMode::Interactive).await {
        RunOutcome::Completed(summary) => summary,
        other => panic!("expected a completed run, got {:?}", other),
    };

    let merge = summary.merge.unwrap();
    assert_eq!(merge.added, vec!["crawl4ai"]);
    assert_eq!(merge.kept, vec!["rag-store"]);

    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&integration_path).unwrap()).unwrap();
    assert_eq!(document["theme"], "dark");
    assert_eq!(document["mcpServers"]["rag-store"]["command"], "mine");
    assert_eq!(
        document["mcpServers"]["crawl4ai"]["url"],
        "http://localhost:11235/mcp/sse"
    );
}
