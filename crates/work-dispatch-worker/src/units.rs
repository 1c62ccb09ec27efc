//! Built-in processing units and the staging sweeper leader duty.

use crate::config::{CommandSpec, UnitSpec};
use crate::registry::CapabilityRegistry;
use crate::stager::{ResourceStager, STAGED_PREFIX};
use crate::unit::{ProcessingUnit, Target, UnitContext, UnitInput, VerifyResults, WorkData};
use anyhow::{bail, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::ExitStatus;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use work_dispatch_coord::LeaderListener;

/// Register the units `specs` describe, in order
pub fn build_registry(specs: &[UnitSpec]) -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    for spec in specs {
        match spec {
            UnitSpec::Log { name } => registry.register(LogUnit::new(name.clone())),
            UnitSpec::Command(spec) => registry.register(CommandUnit::new(spec.clone())),
        };
    }
    registry
}

/// Claims every target, including deletions, and logs it
pub struct LogUnit {
    name: String,
}

impl LogUnit {
    pub fn new(name: impl Into<String>) -> Self {
        LogUnit { name: name.into() }
    }
}

#[async_trait]
impl ProcessingUnit for LogUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_handled(&self, _target: &Target) -> bool {
        true
    }

    fn is_delete_handled(&self, _target: &Target) -> bool {
        true
    }

    async fn execute(&self, input: UnitInput, work: &WorkData<'_>) -> anyhow::Result<()> {
        let size = match &input {
            UnitInput::Empty => 0,
            UnitInput::Memory(bytes) => bytes.len(),
            UnitInput::Staged(path) => tokio::fs::metadata(path).await?.len() as usize,
        };
        info!(
            unit = %self.name,
            message_id = %work.item.message_id,
            priority = %work.item.priority,
            status = %work.target.status,
            "Received {} ({} bytes)",
            work.target,
            size
        );
        Ok(())
    }
}

/// Runs an external program on each staged property it claims
pub struct CommandUnit {
    spec: CommandSpec,
}

impl CommandUnit {
    pub fn new(spec: CommandSpec) -> Self {
        CommandUnit { spec }
    }

    async fn run_setup(&self) -> anyhow::Result<()> {
        let Some((program, args)) = self.spec.setup.split_first() else {
            return Ok(());
        };
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .with_context(|| format!("spawning setup command {}", program))?;
        check_status(program, status)
    }
}

fn check_status(program: &str, status: ExitStatus) -> anyhow::Result<()> {
    if status.success() {
        Ok(())
    } else {
        bail!("{} exited with {}", program, status)
    }
}

#[async_trait]
impl ProcessingUnit for CommandUnit {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn prepare(&mut self, ctx: &UnitContext) -> anyhow::Result<()> {
        if self.spec.setup.is_empty() {
            return Ok(());
        }
        match ctx.locks() {
            Some(locks) => {
                let lock = format!("unit-setup/{}", self.spec.name);
                locks
                    .run_exclusively(&lock, None, |_| self.run_setup())
                    .await??;
            }
            None => self.run_setup().await?,
        }
        info!(unit = %self.spec.name, "Setup command completed");
        Ok(())
    }

    fn is_handled(&self, target: &Target) -> bool {
        match target.property_name() {
            Some(name) => {
                self.spec.properties.is_empty() || self.spec.properties.iter().any(|p| p == name)
            }
            None => false,
        }
    }

    fn requires_local_resource(&self) -> bool {
        true
    }

    async fn execute(&self, input: UnitInput, work: &WorkData<'_>) -> anyhow::Result<()> {
        let Some(path) = input.path() else {
            debug!(unit = %self.spec.name, "No content for {}, skipping", work.target);
            return Ok(());
        };

        let output = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .arg(path)
            .env("WD_MESSAGE_ID", &work.item.message_id)
            .env("WD_ELEMENT_ID", work.target.element.id())
            .env("WD_PROPERTY", work.target.property_name().unwrap_or(""))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawning {}", self.spec.program))?;

        if !output.stderr.is_empty() {
            debug!(
                unit = %self.spec.name,
                "stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        check_status(&self.spec.program, output.status)
    }

    async fn verify(&self) -> VerifyResults {
        let mut results = VerifyResults::ok();
        if let Err(e) = which::which(&self.spec.program) {
            results.add_failure(format!("program {}: {}", self.spec.program, e));
        }
        if let Some(setup) = self.spec.setup.first() {
            if let Err(e) = which::which(setup) {
                results.add_failure(format!("setup program {}: {}", setup, e));
            }
        }
        results
    }
}

/// Deletes staged files older than `max_age` left behind by crashed
/// workers. Runs only while this instance leads its election group.
///
/// Files this process is still handing to units are skipped however old
/// they are. Files staged by other live workers sharing the directory are
/// only protected by `max_age`, so it must exceed the longest unit run.
pub struct StagingSweeper {
    stager: ResourceStager,
    interval: Duration,
    max_age: Duration,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl StagingSweeper {
    pub fn new(stager: ResourceStager, interval: Duration, max_age: Duration) -> Self {
        StagingSweeper {
            stager,
            interval,
            max_age,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }
}

/// Remove staged files in the stager's directory last modified at least
/// `max_age` ago and not in use. Returns how many were removed.
pub async fn sweep_once(stager: &ResourceStager, max_age: Duration) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(stager.dir()).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if !name.to_string_lossy().starts_with(STAGED_PREFIX) {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age || stager.is_in_use(&entry.path()) {
            continue;
        }

        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => warn!("Could not delete stale staged file {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}

#[async_trait]
impl LeaderListener for StagingSweeper {
    async fn on_leader(&self) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let stager = self.stager.clone();
        let interval = self.interval;
        let max_age = self.max_age;

        let task = tokio::spawn(async move {
            let dir = stager.dir();
            info!("Sweeping {} every {:?}", dir.display(), interval);
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => match sweep_once(&stager, max_age).await {
                        Ok(0) => {}
                        Ok(n) => info!("Removed {} stale staged file(s) from {}", n, dir.display()),
                        Err(e) => warn!("Sweep of {} failed: {}", dir.display(), e),
                    },
                }
            }
        });

        let previous = self.running.lock().replace((cancel, task));
        if let Some((cancel, _)) = previous {
            cancel.cancel();
        }
    }

    async fn on_follower(&self) {
        let running = self.running.lock().take();
        if let Some((cancel, task)) = running {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("Staging sweeper ended abnormally: {}", e);
            }
            info!("Stopped sweeping {}", self.stager.dir().display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Content, UnitFilter};
    use bytes::Bytes;
    use std::fs::File;
    use work_dispatch_core::{ElementRef, ElementStatus, Priority, PropertyRef, WorkItem};

    fn command(program: &str, args: &[&str]) -> CommandUnit {
        CommandUnit::new(CommandSpec {
            name: "cmd".to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            properties: vec!["raw".to_string()],
            setup: Vec::new(),
        })
    }

    fn raw_target() -> Target {
        Target::property(
            ElementRef::Vertex("v1".into()),
            PropertyRef::new("k", "raw"),
            ElementStatus::New,
        )
    }

    fn item() -> WorkItem {
        WorkItem::builder()
            .message_id("m1")
            .vertex("v1")
            .priority(Priority::High)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_registry() {
        let registry = build_registry(&[
            UnitSpec::Log {
                name: "log".to_string(),
            },
            UnitSpec::Command(CommandSpec {
                name: "ocr".to_string(),
                program: "tesseract".to_string(),
                args: Vec::new(),
                properties: Vec::new(),
                setup: Vec::new(),
            }),
        ]);
        assert_eq!(registry.names(), vec!["log", "ocr"]);

        let element = Target::element(ElementRef::Vertex("v1".into()), ElementStatus::New);
        let claimants = registry.claimants(&element, &UnitFilter::default());
        assert_eq!(claimants.len(), 1);
        assert_eq!(registry.claimants(&raw_target(), &UnitFilter::default()).len(), 2);
    }

    #[test]
    fn test_command_claims_named_properties() {
        let unit = command("cat", &[]);
        assert!(unit.is_handled(&raw_target()));
        assert!(unit.requires_local_resource());

        let other = Target::property(
            ElementRef::Vertex("v1".into()),
            PropertyRef::named("title"),
            ElementStatus::New,
        );
        assert!(!unit.is_handled(&other));
        assert!(!unit.is_handled(&Target::element(
            ElementRef::Vertex("v1".into()),
            ElementStatus::New
        )));
    }

    #[tokio::test]
    async fn test_verify_checks_program() {
        assert!(command("sh", &[]).verify().await.is_ok());
        let missing = command("definitely-not-installed-wd", &[]).verify().await;
        assert_eq!(missing.failures().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_verify_rejects_file_that_cannot_run() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("extract-text");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();

        let unit = command(tool.to_str().unwrap(), &[]);
        let results = unit.verify().await;
        assert_eq!(results.failures().len(), 1);
        assert!(results.failures()[0].contains("extract-text"));

        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert!(unit.verify().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.data");
        std::fs::write(&path, b"payload").unwrap();

        let item = item();
        let target = raw_target();
        let work = WorkData {
            item: &item,
            target: &target,
        };

        let ok = command("sh", &["-c", "test \"$WD_PROPERTY\" = raw && test -s \"$0\""]);
        ok.execute(UnitInput::Staged(path.clone()), &work).await.unwrap();

        let failing = command("sh", &["-c", "exit 3"]);
        let err = failing
            .execute(UnitInput::Staged(path), &work)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"));

        // Nothing staged, nothing to run
        failing.execute(UnitInput::Empty, &work).await.unwrap();
    }

    #[tokio::test]
    async fn test_log_unit_reports_size() {
        let item = item();
        let target = raw_target();
        let work = WorkData {
            item: &item,
            target: &target,
        };
        LogUnit::new("log")
            .execute(UnitInput::Memory(Bytes::from_static(b"abc")), &work)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_stale_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join(format!("{}old.pdf", STAGED_PREFIX));
        let fresh = dir.path().join(format!("{}new.pdf", STAGED_PREFIX));
        let unrelated = dir.path().join("notes.txt");

        let file = File::create(&stale).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();
        File::create(&fresh).unwrap();
        let file = File::create(&unrelated).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        let stager = ResourceStager::new(dir.path());
        let removed = sweep_once(&stager, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(unrelated.exists());
    }

    #[tokio::test]
    async fn test_sweep_skips_files_still_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let stager = ResourceStager::new(dir.path());
        let staged = stager
            .materialize(Content::from_bytes(Bytes::from_static(b"slow input"), None))
            .await
            .unwrap();
        File::options()
            .write(true)
            .open(staged.path())
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();

        // Long past max_age, but a unit may still be reading it
        assert_eq!(sweep_once(&stager, Duration::from_secs(3600)).await.unwrap(), 0);
        assert!(staged.path().exists());

        // Once released and left behind, it is fair game
        let leftover = staged.path().to_path_buf();
        staged.close();
        std::fs::write(&leftover, b"orphan").unwrap();
        File::options()
            .write(true)
            .open(&leftover)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();
        assert_eq!(sweep_once(&stager, Duration::from_secs(3600)).await.unwrap(), 1);
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_sweeper_follows_leadership() {
        let dir = tempfile::tempdir().unwrap();
        let sweeper = StagingSweeper::new(
            ResourceStager::new(dir.path()),
            Duration::from_secs(60),
            Duration::ZERO,
        );
        assert!(!sweeper.is_running());

        sweeper.on_leader().await;
        assert!(sweeper.is_running());
        sweeper.on_follower().await;
        assert!(!sweeper.is_running());
    }
}
