//! Sandbox module - ownership of the worker's isolate slot
//!
//! The worker owns exactly one box. A job acquires it (cleanup + init),
//! stages files through the returned `SandboxContext`, and releases it
//! (cleanup) when the job ends, whichever way it ends.
//!
//! The box directory belongs to the sandbox uid, so the submission can
//! rewrite anything in it. Everything a verdict depends on lives in a
//! worker-owned state directory per box instead:
//! - `records/`: isolate meta files, never visible inside the box
//! - `judge/`: checker binary, test data and the exported program output,
//!   bound read-only at `/judge` for checker runs only
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the judge's job)
//! - Know about languages or compilation

pub mod config;
pub mod isolate_box;
pub mod meta;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tracing::{info, warn};

pub use config::Limits;
pub use isolate_box::{CommandOutput, IsolateDriver, RunSpec, SandboxDriver, SandboxError};
pub use meta::{parse_meta, ExecStatus, ResourceUsage};

/// Where the trusted directory is bound inside the box
pub const TRUSTED_MOUNT: &str = "/judge";
const TRUSTED_DIR: &str = "judge";
const RECORDS_DIR: &str = "records";

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SandboxError + '_ {
    move |source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Remove a file, symlink or directory tree without following links.
/// Missing paths are fine.
async fn remove_any(path: &Path) -> Result<(), SandboxError> {
    let result = match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => Err(e),
    };
    result.map_err(io_error(path))
}

async fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>, SandboxError> {
    match fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(SandboxError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// The worker's exclusive sandbox slot
#[derive(Clone)]
pub struct Sandbox {
    driver: Arc<dyn SandboxDriver>,
    box_id: u32,
    state_dir: PathBuf,
}

impl Sandbox {
    /// `state_root` must not be reachable from inside any box.
    pub fn new(driver: Arc<dyn SandboxDriver>, box_id: u32, state_root: impl AsRef<Path>) -> Self {
        Self {
            driver,
            box_id,
            state_dir: state_root.as_ref().join(format!("box-{}", box_id)),
        }
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    /// Tear the slot down, state directory included. Idempotent.
    pub async fn reset(&self) -> Result<(), SandboxError> {
        self.driver.cleanup(self.box_id).await?;
        remove_any(&self.state_dir).await
    }

    /// Reset and initialize the slot for one job.
    pub async fn acquire(&self) -> Result<SandboxContext<'_>, SandboxError> {
        self.reset().await?;

        let trusted = self.state_dir.join(TRUSTED_DIR);
        let records = self.state_dir.join(RECORDS_DIR);
        for dir in [&trusted, &records] {
            fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        }
        // the sandbox uid only needs to traverse and read it
        fs::set_permissions(&trusted, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_error(&trusted))?;

        let root = self.driver.init(self.box_id).await?;
        let work_dir = root.join("box");
        info!("Sandbox {} initialized at {}", self.box_id, work_dir.display());

        Ok(SandboxContext {
            sandbox: self,
            work_dir,
            trusted_dir: trusted,
            records_dir: records,
        })
    }
}

/// A freshly initialized box, valid for the job that acquired it. Paths are
/// relative to the directory sandboxed programs see as their working
/// directory, or to the trusted directory for the `trusted_*` calls.
pub struct SandboxContext<'a> {
    sandbox: &'a Sandbox,
    work_dir: PathBuf,
    trusted_dir: PathBuf,
    records_dir: PathBuf,
}

impl SandboxContext<'_> {
    /// Absolute path of `segments` inside the box. No I/O.
    pub fn resolve<I, S>(&self, segments: I) -> PathBuf
    where
        I: IntoIterator<Item = S>,
        S: AsRef<Path>,
    {
        segments
            .into_iter()
            .fold(self.work_dir.clone(), |path, segment| path.join(segment))
    }

    pub async fn run(&self, spec: &RunSpec) -> Result<CommandOutput, SandboxError> {
        self.sandbox.driver.run(self.sandbox.box_id, spec).await
    }

    pub async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<(), SandboxError> {
        let path = self.resolve([name]);
        fs::write(&path, contents).await.map_err(io_error(&path))
    }

    pub async fn exists(&self, name: &str) -> bool {
        fs::try_exists(self.resolve([name])).await.unwrap_or(false)
    }

    /// Read a file from the box; `None` when it does not exist.
    pub async fn read_optional(&self, name: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        read_if_exists(&self.resolve([name])).await
    }

    /// Delete whatever an earlier run left at `name`; missing is fine.
    pub async fn remove(&self, name: &str) -> Result<(), SandboxError> {
        remove_any(&self.resolve([name])).await
    }

    /// Host path of `name` in the trusted directory
    pub fn trusted_path(&self, name: &str) -> PathBuf {
        self.trusted_dir.join(name)
    }

    /// Path of `name` as a checker run sees it through the `/judge` bind
    pub fn mounted(&self, name: &str) -> String {
        format!("{}/{}", TRUSTED_MOUNT, name)
    }

    /// `spec` with the trusted directory bound read-only at `/judge`
    pub fn with_trusted_mount(&self, spec: RunSpec) -> RunSpec {
        spec.with_dir(TRUSTED_MOUNT, self.trusted_dir.clone())
    }

    pub async fn create_trusted_dir(&self, name: &str) -> Result<(), SandboxError> {
        let path = self.trusted_path(name);
        fs::create_dir_all(&path).await.map_err(io_error(&path))
    }

    pub async fn write_trusted(
        &self,
        name: &str,
        contents: impl AsRef<[u8]>,
    ) -> Result<(), SandboxError> {
        let path = self.trusted_path(name);
        fs::write(&path, contents).await.map_err(io_error(&path))
    }

    pub async fn read_trusted(&self, name: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        read_if_exists(&self.trusted_path(name)).await
    }

    /// Move a binary built in the box into the trusted directory, mode 0755.
    /// Returns `false` if the box has no such file.
    pub async fn install_trusted(&self, name: &str) -> Result<bool, SandboxError> {
        let source = self.resolve([name]);
        let target = self.trusted_path(name);
        match fs::symlink_metadata(&source).await {
            Ok(meta) if meta.file_type().is_file() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(source_err) => return Err(io_error(&source)(source_err)),
        }

        fs::copy(&source, &target).await.map_err(io_error(&target))?;
        fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(io_error(&target))?;
        self.remove(name).await?;
        Ok(true)
    }

    /// Copy trusted `name` into the box as `box_name`, replacing whatever
    /// is there.
    pub async fn stage_into_box(&self, name: &str, box_name: &str) -> Result<(), SandboxError> {
        let target = self.resolve([box_name]);
        remove_any(&target).await?;
        fs::copy(self.trusted_path(name), &target)
            .await
            .map_err(io_error(&target))?;
        Ok(())
    }

    /// Snapshot the box file `box_name` into the trusted directory as
    /// `name`. Anything but a regular file exports as empty; returns whether
    /// a regular file was found.
    pub async fn export_from_box(&self, box_name: &str, name: &str) -> Result<bool, SandboxError> {
        let source = self.resolve([box_name]);
        let target = self.trusted_path(name);
        remove_any(&target).await?;

        let regular = matches!(
            fs::symlink_metadata(&source).await,
            Ok(meta) if meta.file_type().is_file()
        );
        if regular {
            fs::copy(&source, &target).await.map_err(io_error(&target))?;
        } else {
            fs::write(&target, b"").await.map_err(io_error(&target))?;
        }
        Ok(regular)
    }

    /// Where isolate should write the meta record `name`. Outside the box.
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.records_dir.join(name)
    }

    pub async fn clear_record(&self, name: &str) -> Result<(), SandboxError> {
        remove_any(&self.record_path(name)).await
    }

    /// Read and delete the record `name`; `None` if isolate wrote none.
    pub async fn take_record(&self, name: &str) -> Result<Option<Vec<u8>>, SandboxError> {
        let data = read_if_exists(&self.record_path(name)).await?;
        self.clear_record(name).await?;
        Ok(data)
    }

    /// Give the slot back. Failures are logged; the next acquisition resets
    /// the slot again anyway.
    pub async fn release(self) {
        match self.sandbox.reset().await {
            Ok(()) => info!("Sandbox {} released", self.sandbox.box_id),
            Err(e) => warn!("Failed to release sandbox {}: {}", self.sandbox.box_id, e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDriver;
    use super::*;

    fn sandbox() -> (Arc<FakeDriver>, Sandbox) {
        let driver = Arc::new(FakeDriver::new(|_, _| CommandOutput::default()));
        let sandbox = Sandbox::new(driver.clone(), 0, driver.state_root());
        (driver, sandbox)
    }

    #[tokio::test]
    async fn test_acquire_resets_then_inits() {
        let (driver, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();

        assert_eq!(driver.calls(), vec!["cleanup", "init"]);
        let work_dir = ctx.resolve(Vec::<&str>::new());
        assert_eq!(work_dir, driver.box_dir());
        assert!(work_dir.is_dir());
    }

    #[tokio::test]
    async fn test_resolve_is_scoped_to_box() {
        let (driver, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();

        assert_eq!(ctx.resolve(["tests", "1.in"]), driver.box_dir().join("tests/1.in"));
        assert_eq!(ctx.resolve(Vec::<&str>::new()), driver.box_dir());
    }

    #[tokio::test]
    async fn test_reset_twice_equals_once() {
        let (driver, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();
        ctx.write("stale", b"left over").await.unwrap();
        drop(ctx);

        sandbox.reset().await.unwrap();
        let after_once = driver.box_dir().exists();
        sandbox.reset().await.unwrap();
        let after_twice = driver.box_dir().exists();

        assert!(!after_once);
        assert_eq!(after_once, after_twice);
    }

    #[tokio::test]
    async fn test_release_clears_job_files() {
        let (driver, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();
        ctx.write("program.cpp", "int main() {}").await.unwrap();
        ctx.write_trusted("out", "1 2 3").await.unwrap();
        assert!(ctx.exists("program.cpp").await);

        ctx.release().await;
        assert!(!driver.box_dir().exists());
        assert!(!driver.state_root().join("box-0").exists());

        // next job starts from an empty box
        let ctx = sandbox.acquire().await.unwrap();
        assert!(!ctx.exists("program.cpp").await);
        assert_eq!(ctx.read_optional("program.cpp").await.unwrap(), None);
        assert_eq!(ctx.read_trusted("out").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_lives_outside_the_box() {
        let (driver, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();

        let record = ctx.record_path("meta");
        let trusted = ctx.trusted_path("checker");
        assert_eq!(record, driver.state_root().join("box-0/records/meta"));
        assert!(!record.starts_with(driver.box_dir()));
        assert!(!trusted.starts_with(driver.box_dir()));
        assert_eq!(ctx.mounted("tests/1.in"), "/judge/tests/1.in");

        let spec = ctx.with_trusted_mount(RunSpec::new(["/judge/checker"], Limits::checker()));
        assert_eq!(
            spec.dirs,
            vec![("/judge".to_string(), driver.state_root().join("box-0/judge"))]
        );

        let mode = std::fs::metadata(driver.state_root().join("box-0/judge"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_take_record_consumes_it() {
        let (_, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();

        assert_eq!(ctx.take_record("meta").await.unwrap(), None);
        std::fs::write(ctx.record_path("meta"), "status:TO\n").unwrap();
        assert_eq!(ctx.take_record("meta").await.unwrap().unwrap(), b"status:TO\n");
        assert_eq!(ctx.take_record("meta").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_install_trusted_moves_binary_out_of_box() {
        let (_, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();

        assert!(!ctx.install_trusted("checker").await.unwrap());

        ctx.write("checker", "\x7fELF").await.unwrap();
        assert!(ctx.install_trusted("checker").await.unwrap());
        assert!(!ctx.exists("checker").await);

        let mode = std::fs::metadata(ctx.trusted_path("checker"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn test_export_refuses_links_and_directories() {
        let (_, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();
        ctx.write_trusted("secret", "the answer").await.unwrap();

        ctx.write("out", "42").await.unwrap();
        assert!(ctx.export_from_box("out", "exported").await.unwrap());
        assert_eq!(ctx.read_trusted("exported").await.unwrap().unwrap(), b"42");

        ctx.remove("out").await.unwrap();
        std::os::unix::fs::symlink(ctx.trusted_path("secret"), ctx.resolve(["out"])).unwrap();
        assert!(!ctx.export_from_box("out", "exported").await.unwrap());
        assert_eq!(ctx.read_trusted("exported").await.unwrap().unwrap(), b"");

        ctx.remove("out").await.unwrap();
        std::fs::create_dir(ctx.resolve(["out"])).unwrap();
        assert!(!ctx.export_from_box("out", "exported").await.unwrap());
        ctx.remove("out").await.unwrap();
        assert!(!ctx.exists("out").await);

        // missing output exports as empty too
        assert!(!ctx.export_from_box("out", "exported").await.unwrap());
        assert_eq!(ctx.read_trusted("exported").await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn test_stage_into_box_replaces_planted_link() {
        let (_, sandbox) = sandbox();
        let ctx = sandbox.acquire().await.unwrap();
        ctx.write_trusted("1.in", "5 7").await.unwrap();
        ctx.write_trusted("1.ans", "12").await.unwrap();

        std::os::unix::fs::symlink(ctx.trusted_path("1.ans"), ctx.resolve(["input"])).unwrap();
        ctx.stage_into_box("1.in", "input").await.unwrap();

        assert_eq!(ctx.read_optional("input").await.unwrap().unwrap(), b"5 7");
        assert_eq!(ctx.read_trusted("1.ans").await.unwrap().unwrap(), b"12");
    }
}
