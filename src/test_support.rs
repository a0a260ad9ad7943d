//! Shared fixtures for unit tests: a recording image engine, a manual clock,
//! a wait strategy that advances it, and a fully wired service harness.

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Result, TransformError};
use crate::generator::{GenerationCoordinator, TokioWait, WaitStrategy};
use crate::image_processor::{fit_dimensions, Anchor, ImageEngine, RasterImage};
use crate::index::record::{join_path, Asset};
use crate::index::repository::InMemoryIndexRepository;
use crate::pipeline::ImagePipeline;
use crate::service::TransformService;
use crate::transform::definition::Interlace;
use crate::volume::MemoryVolume;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub(crate) fn config_in(dir: &Path) -> Config {
    Config {
        cache_dir: Some(dir.join("cache")),
        ..Default::default()
    }
}

pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }
}

impl ManualClock {
    pub(crate) fn advance(&self, by: chrono::Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

type SleepHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Advances the manual clock instead of sleeping
pub(crate) struct AdvancingWait {
    clock: Arc<ManualClock>,
    sleeps: AtomicUsize,
    hooks: Mutex<Vec<(usize, SleepHook)>>,
}

impl AdvancingWait {
    pub(crate) fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            sleeps: AtomicUsize::new(0),
            hooks: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` during the `nth` sleep (1-based)
    pub(crate) fn on_sleep<F>(&self, nth: usize, hook: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.hooks.lock().unwrap().push((nth, Box::new(hook)));
    }

    pub(crate) fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WaitStrategy for AdvancingWait {
    async fn sleep(&self, interval: Duration) {
        self.clock.advance(chrono::Duration::from_std(interval).unwrap());
        let nth = self.sleeps.fetch_add(1, Ordering::SeqCst) + 1;

        let due: Vec<SleepHook> = {
            let mut hooks = self.hooks.lock().unwrap();
            let (due, rest): (Vec<_>, Vec<_>) = hooks.drain(..).partition(|(n, _)| *n == nth);
            *hooks = rest;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        for hook in due {
            hook().await;
        }
    }
}

/// Operation recorded by the mock engine
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Op {
    Fit(Option<u32>, Option<u32>),
    Resize(u32, u32),
    Crop(u32, u32, bool, Anchor),
    Quality(u8),
    Interlace(Interlace),
    Save(String),
}

pub(crate) struct MockEngine {
    width: u32,
    height: u32,
    ops: Arc<Mutex<Vec<Op>>>,
    transparent: AtomicBool,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl MockEngine {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ops: Arc::new(Mutex::new(Vec::new())),
            transparent: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    /// Number of files encoded
    pub(crate) fn render_count(&self) -> usize {
        self.ops().iter().filter(|op| matches!(op, Op::Save(_))).count()
    }

    pub(crate) fn set_transparent(&self, transparent: bool) {
        self.transparent.store(transparent, Ordering::SeqCst);
    }

    pub(crate) fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

impl ImageEngine for MockEngine {
    fn load(&self, path: &Path) -> Result<Box<dyn RasterImage>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransformError::GenerationFailed("mock engine failure".to_string()));
        }
        std::fs::metadata(path)?;
        Ok(Box::new(MockImage {
            width: self.width,
            height: self.height,
            ops: self.ops.clone(),
            transparent: self.transparent.load(Ordering::SeqCst),
            delay: *self.delay.lock().unwrap(),
        }))
    }

    fn supports_output(&self, format: &str) -> bool {
        matches!(format, "jpg" | "jpeg" | "png" | "gif" | "webp")
    }

    fn supports_alpha_probe(&self) -> bool {
        true
    }

    fn supports_interlace(&self, format: &str) -> bool {
        format == "jpg"
    }
}

struct MockImage {
    width: u32,
    height: u32,
    ops: Arc<Mutex<Vec<Op>>>,
    transparent: bool,
    delay: Duration,
}

impl MockImage {
    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

impl RasterImage for MockImage {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn scale_to_fit(&mut self, width: Option<u32>, height: Option<u32>) -> Result<()> {
        self.record(Op::Fit(width, height));
        (self.width, self.height) = fit_dimensions(self.width, self.height, width, height);
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.record(Op::Resize(width, height));
        (self.width, self.height) = (width, height);
        Ok(())
    }

    fn scale_and_crop(&mut self, width: u32, height: u32, allow_upscale: bool, anchor: Anchor) -> Result<()> {
        self.record(Op::Crop(width, height, allow_upscale, anchor));
        (self.width, self.height) = (width, height);
        Ok(())
    }

    fn set_quality(&mut self, quality: u8) {
        self.record(Op::Quality(quality));
    }

    fn set_interlace(&mut self, interlace: Interlace) {
        self.record(Op::Interlace(interlace));
    }

    fn is_transparent(&self) -> bool {
        self.transparent
    }

    fn save_as(&self, path: &Path) -> Result<()> {
        std::thread::sleep(self.delay);
        self.record(Op::Save(path.to_string_lossy().to_string()));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, format!("{}x{}", self.width, self.height))?;
        Ok(())
    }
}

/// A service wired with in-memory storage, the mock engine and the manual clock
pub(crate) struct Harness {
    pub temp_dir: TempDir,
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub wait: Arc<AdvancingWait>,
    pub engine: Arc<MockEngine>,
    pub repository: Arc<InMemoryIndexRepository>,
    pub volume: Arc<MemoryVolume>,
    pub service: TransformService,
    system_wait: bool,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            max_cached_cloud_image_size: 0,
            ..config_in(temp_dir.path())
        };
        Self::assemble(temp_dir, config, false).await
    }

    /// Real sleeps with a short poll interval, for multi-threaded tests
    pub(crate) async fn with_system_wait() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            max_cached_cloud_image_size: 0,
            poll_interval_ms: 10,
            ..config_in(temp_dir.path())
        };
        Self::assemble(temp_dir, config, true).await
    }

    /// Rebuild every component after changing `config`
    pub(crate) async fn rebuild(self) -> Self {
        Self::assemble(self.temp_dir, self.config, self.system_wait).await
    }

    async fn assemble(temp_dir: TempDir, config: Config, system_wait: bool) -> Self {
        let clock = Arc::new(ManualClock::default());
        let wait = Arc::new(AdvancingWait::new(clock.clone()));
        let engine = Arc::new(MockEngine::new(4000, 3000));
        let repository = Arc::new(InMemoryIndexRepository::new(clock.clone()));
        let volume = Arc::new(MemoryVolume::new("uploads", "https://cdn.test"));
        let wait_strategy: Arc<dyn WaitStrategy> = if system_wait {
            Arc::new(TokioWait)
        } else {
            wait.clone()
        };

        let service = TransformService::builder(config.clone())
            .volume(volume.clone())
            .engine(engine.clone())
            .repository(repository.clone())
            .clock(clock.clone())
            .wait_strategy(wait_strategy)
            .build()
            .await
            .unwrap();

        Self {
            temp_dir,
            config,
            clock,
            wait,
            engine,
            repository,
            volume,
            service,
            system_wait,
        }
    }

    /// Asset in the `photos` folder whose source bytes live in the memory volume
    pub(crate) fn remote_asset(&self, id: i64, filename: &str) -> Asset {
        self.volume.put(&join_path("photos", filename), b"source".to_vec());
        Asset::new(
            id,
            "uploads",
            "photos",
            filename,
            self.clock.now() - chrono::Duration::hours(1),
        )
    }

    pub(crate) fn coordinator(&self) -> &GenerationCoordinator {
        self.service.coordinator()
    }

    pub(crate) fn pipeline(&self) -> &ImagePipeline {
        self.service.coordinator().pipeline()
    }
}
