//! End-to-end pipeline tests against a throwaway project driven by `sh`.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buildforge_core::{
    ArchiveError, ArchiveSummary, Archiver, BuildResult, BuildforgeConfig, ConcurrencyPolicy,
    PackagerState, Pipeline, PipelineError, ProcessToolchain, PublishResolver, SuggestionTable,
    Toolchain, ToolchainLimits, ToolchainStage, ZipArchiver,
};
use tokio::io::AsyncReadExt;

const STAGE_TREE: &str = "mkdir -p build/staging/lib \
    && echo hello > build/staging/readme.txt \
    && printf abc > build/staging/lib/a.bin";

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn project_config(dir: &Path) -> BuildforgeConfig {
    let mut config = BuildforgeConfig::for_project(dir);
    config.toolchain.clean = sh("rm -rf build/bin");
    config.toolchain.build = sh("mkdir -p build/bin && echo binary > build/bin/app");
    config.toolchain.package = sh(STAGE_TREE);
    config.toolchain.timeout_ms = 10_000;
    config
}

/// Wraps the process toolchain and counts packaging invocations.
struct CountingToolchain {
    inner: ProcessToolchain,
    packages: Arc<AtomicUsize>,
}

#[async_trait]
impl Toolchain for CountingToolchain {
    async fn run(
        &self,
        stage: ToolchainStage,
        command: &[String],
        limits: &ToolchainLimits,
    ) -> BuildResult {
        if stage == ToolchainStage::Package {
            self.packages.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.run(stage, command, limits).await
    }
}

/// Archiver that only records whether it was called.
#[derive(Default)]
struct RecordingArchiver {
    calls: AtomicUsize,
}

#[async_trait]
impl Archiver for RecordingArchiver {
    async fn archive(&self, source: &Path, dest: &Path) -> Result<ArchiveSummary, ArchiveError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ZipArchiver::new().archive(source, dest).await
    }
}

fn counting_pipeline(config: BuildforgeConfig) -> (Arc<Pipeline>, Arc<AtomicUsize>) {
    let packages = Arc::new(AtomicUsize::new(0));
    let toolchain = CountingToolchain {
        inner: ProcessToolchain::from_config(&config.toolchain, Arc::new(SuggestionTable::standard())),
        packages: Arc::clone(&packages),
    };
    let pipeline = Pipeline::with_components(config, Arc::new(toolchain), Arc::new(ZipArchiver::new()));
    (Arc::new(pipeline), packages)
}

async fn wait_until_busy(pipeline: &Pipeline) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pipeline.guard().is_busy() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline never became busy");
}

fn read_archive(path: &Path) -> Vec<(String, String)> {
    let file = std::fs::File::open(path).unwrap();
    let mut archive = zip::ZipArchive::new(file).unwrap();
    let mut entries = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).unwrap();
        let mut contents = String::new();
        if entry.is_file() {
            entry.read_to_string(&mut contents).unwrap();
        }
        entries.push((entry.name().to_string(), contents));
    }
    entries.sort();
    entries
}

/// Test: full package run produces an archive mirroring the staging tree
#[tokio::test]
async fn test_package_produces_archive() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = Pipeline::new(project_config(dir.path())).unwrap();

    let result = pipeline.package().await.expect("package run");

    assert!(result.success);
    assert!(result.build.as_ref().is_some_and(|b| b.success));
    assert_eq!(result.states.first(), Some(&PackagerState::Idle));
    assert_eq!(result.states.last(), Some(&PackagerState::Done));
    assert_eq!(
        result.archive_size_bytes,
        std::fs::metadata(&result.archive_path).unwrap().len()
    );

    let files = result.manifest.files();
    assert_eq!(files.get("readme.txt"), Some(&6));
    assert_eq!(files.get("lib/a.bin"), Some(&3));

    let entries = read_archive(&result.archive_path);
    assert!(entries.contains(&("readme.txt".to_string(), "hello\n".to_string())));
    assert!(entries.contains(&("lib/a.bin".to_string(), "abc".to_string())));
    assert!(entries.iter().any(|(name, _)| name == "lib/"));

    let info = pipeline.package_info().await;
    assert!(info.exists);
    assert_eq!(info.size_bytes, Some(result.archive_size_bytes));
}

/// Test: package target that leaves no staging tree fails before archiving
#[tokio::test]
async fn test_missing_staging_tree_stops_before_archive() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.package = sh("true");
    let archive_path = config.artifacts.archive_path.clone();

    let archiver = Arc::new(RecordingArchiver::default());
    let toolchain = ProcessToolchain::from_config(&config.toolchain, Arc::new(SuggestionTable::standard()));
    let pipeline = Pipeline::with_components(config, Arc::new(toolchain), archiver.clone());

    let failure = pipeline.package().await.unwrap_err();

    assert_eq!(failure.stage, PackagerState::ValidatingStagingTree);
    assert_eq!(failure.states.last(), Some(&PackagerState::Failed));
    match &failure.error {
        PipelineError::StagingTreeMissing { listing, .. } => {
            // build/bin exists because the build step ran.
            assert!(listing.entries("bin").is_some());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(archiver.calls.load(Ordering::SeqCst), 0);
    assert!(!archive_path.exists());
}

/// Test: a build failure carries the matching suggestion
#[tokio::test]
async fn test_build_failure_carries_suggestion() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.build = sh("echo 'main.o: undefined reference to `frobnicate`' >&2; exit 2");
    let pipeline = Pipeline::new(config).unwrap();

    let failure = pipeline.package().await.unwrap_err();

    assert_eq!(failure.stage, PackagerState::Building);
    assert_eq!(failure.error.code(), "toolchain_failure");
    let build = failure.error.build_result().expect("build result attached");
    assert_eq!(build.exit_code(), Some(2));
    assert!(build.stderr.contains("undefined reference"));
    assert!(build.suggestion.is_some());
}

/// Test: build() reports the build step and ignores a failing clean
#[tokio::test]
async fn test_build_survives_failing_clean() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.clean = sh("exit 3");
    let pipeline = Pipeline::new(config).unwrap();

    let result = pipeline.build().await.expect("build");
    assert!(result.success);
    assert_eq!(result.stage, ToolchainStage::Build);
    assert!(dir.path().join("build/bin/app").is_file());
}

/// Test: the side artifact is copied into the staging tree and archived
#[tokio::test]
async fn test_side_artifact_is_archived() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("extras")).unwrap();
    std::fs::write(dir.path().join("extras/helper.sh"), "#!/bin/sh\n").unwrap();

    let mut config = project_config(dir.path());
    config.artifacts.side_artifact = Some(dir.path().join("extras/helper.sh"));
    let pipeline = Pipeline::new(config).unwrap();

    let result = pipeline.package().await.expect("package run");

    let copied: PathBuf = result.side_artifact.expect("side artifact copied");
    assert!(copied.ends_with("tools/helper.sh"));
    let entries = read_archive(&result.archive_path);
    assert!(entries.iter().any(|(name, _)| name == "tools/helper.sh"));
}

/// Test: an absent side artifact is skipped without failing the run
#[tokio::test]
async fn test_absent_side_artifact_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.artifacts.side_artifact = Some(dir.path().join("extras/missing.sh"));
    let pipeline = Pipeline::new(config).unwrap();

    let result = pipeline.package().await.expect("package run");
    assert!(result.side_artifact.is_none());
    assert!(result.states.contains(&PackagerState::AugmentingArtifacts));
}

/// Test: a second package request while one runs is rejected
#[tokio::test]
async fn test_concurrent_package_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.build = sh("sleep 1");
    let pipeline = Arc::new(Pipeline::new(config).unwrap());

    let first = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.package().await })
    };
    wait_until_busy(&pipeline).await;

    let second = pipeline.package().await.unwrap_err();
    assert!(matches!(second.error, PipelineError::BuildInProgress));
    assert_eq!(second.stage, PackagerState::Idle);

    let rejected_build = pipeline.build().await.unwrap_err();
    assert_eq!(rejected_build.code(), "build_in_progress");

    assert!(first.await.unwrap().is_ok());
}

/// Test: with the queue policy both requests complete in turn
#[tokio::test]
async fn test_concurrent_package_is_queued() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.build = sh("sleep 0.3");
    config.concurrency = ConcurrencyPolicy::Queue;
    let pipeline = Arc::new(Pipeline::new(config).unwrap());

    let first = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.package().await })
    };
    wait_until_busy(&pipeline).await;

    let second = pipeline.package().await.expect("queued run");
    let first = first.await.unwrap().expect("first run");
    assert_ne!(first.run_id, second.run_id);
}

/// Test: resolving a missing archive rebuilds once, then serves it
#[tokio::test]
async fn test_resolve_rebuilds_missing_archive_once() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, packages) = counting_pipeline(project_config(dir.path()));
    let resolver = PublishResolver::new(Arc::clone(&pipeline));

    let mut first = resolver.resolve().await.expect("rebuilt archive");
    assert!(first.rebuilt);
    assert_eq!(first.name, "package.zip");
    let mut bytes = Vec::new();
    first.file.read_to_end(&mut bytes).await.unwrap();
    assert_eq!(bytes.len() as u64, first.size_bytes);
    assert_eq!(packages.load(Ordering::SeqCst), 1);

    let second = resolver.resolve().await.expect("existing archive");
    assert!(!second.rebuilt);
    assert_eq!(packages.load(Ordering::SeqCst), 1);
}

/// Test: concurrent resolves of a missing archive share one rebuild
#[tokio::test]
async fn test_concurrent_resolves_share_one_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.build = sh("sleep 0.3");
    let (pipeline, packages) = counting_pipeline(config);
    let resolver = PublishResolver::new(pipeline);

    let (a, b) = tokio::join!(resolver.resolve(), resolver.resolve());

    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(packages.load(Ordering::SeqCst), 1);
}

/// Test: a failed rebuild yields not found after exactly one attempt
#[tokio::test]
async fn test_resolve_failed_rebuild_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = project_config(dir.path());
    config.toolchain.package = sh(
        "echo \"error CS0246: The type or namespace name 'Widget' could not be found\" >&2; exit 1",
    );
    let (pipeline, packages) = counting_pipeline(config);
    let resolver = PublishResolver::new(pipeline);

    let err = resolver.resolve().await.unwrap_err();

    assert_eq!(err.code(), "artifact_not_found");
    assert!(err.to_string().contains("rebuild failed"));
    let package = err.build_result().expect("rebuild output attached");
    assert!(package.stderr.contains("CS0246"));
    assert!(package.suggestion.is_some());
    match err {
        PipelineError::ArtifactNotFound {
            name,
            searched,
            rebuild,
            ..
        } => {
            assert_eq!(name, "package.zip");
            assert_eq!(searched.len(), 1);
            let rebuild = rebuild.expect("rebuild failure attached");
            assert_eq!(rebuild.stage, PackagerState::PackagingToolchain);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(packages.load(Ordering::SeqCst), 1);
}

/// Test: named downloads come from the candidate list and never rebuild
#[tokio::test]
async fn test_resolve_download_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, packages) = counting_pipeline(project_config(dir.path()));
    pipeline.build().await.expect("build");
    let resolver = PublishResolver::new(pipeline);

    let app = resolver.resolve_download("app").await.expect("compiled output");
    assert_eq!(app.name, "app");
    assert_eq!(app.size_bytes, "binary\n".len() as u64);
    assert!(!app.rebuilt);

    match resolver.resolve_download("nothing-here").await.unwrap_err() {
        PipelineError::ArtifactNotFound { searched, .. } => assert_eq!(searched.len(), 3),
        other => panic!("unexpected error: {other}"),
    }
    match resolver.resolve_download("../secret").await.unwrap_err() {
        PipelineError::ArtifactNotFound { searched, .. } => assert!(searched.is_empty()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(packages.load(Ordering::SeqCst), 0);
}

/// Test: a directory shadowing a download name falls through to later candidates
#[tokio::test]
async fn test_resolve_download_skips_directories() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, packages) = counting_pipeline(project_config(dir.path()));
    let archive = pipeline.package().await.expect("package run").archive_path;
    std::fs::create_dir_all(dir.path().join("dist/docs")).unwrap();
    let resolver = PublishResolver::new(pipeline);

    let found = resolver.resolve_download("docs").await.expect("archive fallback");
    assert_eq!(found.path, archive);
    assert_eq!(found.name, "package.zip");
    assert_eq!(packages.load(Ordering::SeqCst), 1);
}

/// Test: a missing download carries no rebuild diagnostics
#[tokio::test]
async fn test_resolve_download_miss_has_no_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = counting_pipeline(project_config(dir.path()));
    let resolver = PublishResolver::new(pipeline);

    let err = resolver.resolve_download("nothing").await.unwrap_err();
    assert!(err.build_result().is_none());
    assert!(matches!(
        err,
        PipelineError::ArtifactNotFound { rebuild: None, .. }
    ));
}

/// Test: config loaded from TOML resolves paths against the file
#[tokio::test]
async fn test_pipeline_from_toml_config() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("buildforge.toml");
    std::fs::write(
        &config_path,
        r#"
concurrency = "queue"

[toolchain]
project_dir = "."
clean = []
build = ["sh", "-c", "true"]
package = ["sh", "-c", "mkdir -p out/stage && echo x > out/stage/x.txt"]

[artifacts]
output_dir = "out"
staging_dir = "out/stage"
archive_path = "dist/app.zip"
"#,
    )
    .unwrap();

    let config = BuildforgeConfig::load(&config_path).unwrap();
    let pipeline = Pipeline::new(config).unwrap();
    let result = pipeline.package().await.expect("package run");

    assert!(result.archive_path.starts_with(dir.path()));
    assert!(result.archive_path.ends_with("dist/app.zip"));
    assert_eq!(result.manifest.files().get("x.txt"), Some(&2));
}
