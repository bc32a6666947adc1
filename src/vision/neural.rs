//! Accurate (neural) engine adapter
//!
//! Owns the one piece of shared state in the pipeline: a lazily loaded model
//! handle. Loading is single-flight: concurrent first calls wait on the same
//! async lock and only one of them runs the loader. `dispose` drops the handle
//! and the next call loads it again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{EngineKind, EngineResult, OcrEngine, Progress};
use crate::error::{ErrorCode, OcrError};
use crate::input::PixelBuffer;

/// A loaded model that can recognize text. Called from the blocking pool.
pub trait TextRecognizer: Send + Sync {
    fn recognize(&self, image: &PixelBuffer) -> Result<EngineResult, OcrError>;
}

/// Produces the recognizer handle on first use
#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    /// Load the model. Failures must already be classified
    /// (`MODEL_LOAD_FAILED`, `NETWORK_ERROR`, `OUT_OF_MEMORY`, ...).
    async fn load(&self, progress: &Progress) -> Result<Arc<dyn TextRecognizer>, OcrError>;
}

/// Accurate engine: lazily loaded recognizer behind a single-flight slot
pub struct NeuralEngine<L> {
    loader: L,
    handle: Mutex<Option<Arc<dyn TextRecognizer>>>,
    /// Mirrors `handle.is_some()`; only written under the slot lock
    loaded: AtomicBool,
    loads: AtomicU64,
}

impl<L: ModelLoader> NeuralEngine<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            handle: Mutex::new(None),
            loaded: AtomicBool::new(false),
            loads: AtomicU64::new(0),
        }
    }

    /// Get the cached handle, loading it if this is the first use
    pub async fn handle(&self, progress: &Progress) -> Result<Arc<dyn TextRecognizer>, OcrError> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            return Ok(handle.clone());
        }

        let start = Instant::now();
        info!("Loading {} model", self.loader.name());
        progress.report("loading model", 0);

        let handle = self.loader.load(progress).await.inspect_err(|e| {
            warn!("Failed to load {} model: {}", self.loader.name(), e.code());
        })?;

        self.loads.fetch_add(1, Ordering::SeqCst);
        info!("{} model loaded in {:?}", self.loader.name(), start.elapsed());
        progress.report("model loaded", 100);

        *slot = Some(handle.clone());
        self.loaded.store(true, Ordering::SeqCst);
        Ok(handle)
    }

    /// True while a handle is cached, even if another task holds the slot
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    /// Number of successful loads so far
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Drop the cached handle
    pub async fn release(&self) {
        let mut slot = self.handle.lock().await;
        if slot.take().is_some() {
            self.loaded.store(false, Ordering::SeqCst);
            info!("Released {} model", self.loader.name());
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }
}

#[async_trait]
impl<L: ModelLoader> OcrEngine for NeuralEngine<L> {
    fn kind(&self) -> EngineKind {
        EngineKind::Accurate
    }

    fn name(&self) -> &str {
        self.loader.name()
    }

    async fn recognize(&self, image: &PixelBuffer, progress: &Progress) -> Result<EngineResult, OcrError> {
        let handle = self.handle(&progress.scoped(0, 50)).await?;

        progress.report("recognizing text", 50);
        let start = Instant::now();

        let image = image.clone();
        let result = tokio::task::spawn_blocking(move || handle.recognize(&image))
            .await
            .map_err(|e| {
                OcrError::new(ErrorCode::OcrProcessingFailed)
                    .with_context(format!("recognizer task failed: {}", e))
            })??;

        progress.report("recognized", 100);
        info!(
            "{}: {} chars in {:?}",
            self.loader.name(),
            result.text_length(),
            start.elapsed()
        );

        if result.text.trim().is_empty() {
            return Err(OcrError::new(ErrorCode::OcrNoTextFound)
                .with_details(json!({ "engine": self.loader.name() })));
        }

        Ok(result)
    }

    async fn dispose(&self) {
        self.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FixedRecognizer(&'static str);

    impl TextRecognizer for FixedRecognizer {
        fn recognize(&self, _image: &PixelBuffer) -> Result<EngineResult, OcrError> {
            Ok(EngineResult::new(self.0, 77.0))
        }
    }

    struct SlowLoader {
        calls: AtomicU64,
        fail: AtomicBool,
        text: &'static str,
    }

    impl SlowLoader {
        fn new(text: &'static str) -> Self {
            Self {
                calls: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                text,
            }
        }
    }

    #[async_trait]
    impl ModelLoader for SlowLoader {
        fn name(&self) -> &str {
            "test-model"
        }

        async fn load(&self, _progress: &Progress) -> Result<Arc<dyn TextRecognizer>, OcrError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(OcrError::new(ErrorCode::ModelLoadFailed));
            }
            Ok(Arc::new(FixedRecognizer(self.text)))
        }
    }

    fn image() -> PixelBuffer {
        PixelBuffer::filled(4, 4, [255, 255, 255, 255]).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_first_use_loads_once() {
        let engine = NeuralEngine::new(SlowLoader::new("hello"));
        let progress = Progress::none();

        let (a, b) = tokio::join!(engine.handle(&progress), engine.handle(&progress));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(engine.loader().calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.load_count(), 1);
        assert!(engine.is_loaded());
    }

    #[tokio::test]
    async fn test_loaded_while_slot_is_held() {
        let engine = NeuralEngine::new(SlowLoader::new("busy"));
        engine.handle(&Progress::none()).await.unwrap();

        let _slot = engine.handle.lock().await;
        assert!(engine.is_loaded());
    }

    #[tokio::test]
    async fn test_concurrent_recognize_shares_handle() {
        let engine = Arc::new(NeuralEngine::new(SlowLoader::new("shared")));
        let img = image();

        let first = {
            let engine = engine.clone();
            let img = img.clone();
            tokio::spawn(async move { engine.recognize(&img, &Progress::none()).await })
        };
        let second = {
            let engine = engine.clone();
            let img = img.clone();
            tokio::spawn(async move { engine.recognize(&img, &Progress::none()).await })
        };

        assert_eq!(first.await.unwrap().unwrap().text, "shared");
        assert_eq!(second.await.unwrap().unwrap().text, "shared");
        assert_eq!(engine.load_count(), 1);
    }

    #[tokio::test]
    async fn test_dispose_forces_reload() {
        let engine = NeuralEngine::new(SlowLoader::new("again"));
        let img = image();

        engine.recognize(&img, &Progress::none()).await.unwrap();
        engine.dispose().await;
        assert!(!engine.is_loaded());

        engine.recognize(&img, &Progress::none()).await.unwrap();
        assert_eq!(engine.load_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_cached() {
        let engine = NeuralEngine::new(SlowLoader::new("later"));
        engine.loader().fail.store(true, Ordering::SeqCst);

        let err = engine.recognize(&image(), &Progress::none()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModelLoadFailed);
        assert!(!engine.is_loaded());

        engine.loader().fail.store(false, Ordering::SeqCst);
        let result = engine.recognize(&image(), &Progress::none()).await.unwrap();
        assert_eq!(result.text, "later");
        assert_eq!(engine.loader().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_text_is_no_text_found() {
        let engine = NeuralEngine::new(SlowLoader::new("   "));
        let err = engine.recognize(&image(), &Progress::none()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::OcrNoTextFound);
        assert_eq!(engine.kind(), EngineKind::Accurate);
    }
}
