//! The shader-compile variant of the producer: adapts a [`RenderBackend`]
//! to the [`Compiler`] contract, keyed by source hash instead of guest
//! address.
//!
//! Usage: [`ShaderCompiler::stage`] the sources, then queue the returned key
//! through the same [`crate::Fabric`] machinery used for translations: a
//! `Fabric<Program>` built over a `ShaderCompiler` is a GPU program
//! pipeline with the exact same aging, dedup and frame-pacing behavior.

use std::sync::Arc;

use nohash_hasher::IntMap;
use parking_lot::Mutex;

use hl_core::{
    CompileError, Compiler, ExecMode, ProgramInfo, RenderBackend, ShaderSource, Translated,
};

/// Bridges staged shader sources to the worker pool.
pub struct ShaderCompiler<P> {
    backend: Arc<dyn RenderBackend<P>>,
    staged: Mutex<IntMap<u64, (Vec<ShaderSource>, ProgramInfo)>>,
}

impl<P> ShaderCompiler<P> {
    pub fn new(backend: Arc<dyn RenderBackend<P>>) -> Self {
        Self {
            backend,
            staged: Mutex::new(IntMap::default()),
        }
    }

    /// Parks sources under their hash until a worker picks the key up.
    /// Returns the key to enqueue. Staging the same hash twice is
    /// idempotent (first writer wins; the sources are equal by definition).
    pub fn stage(&self, sources: Vec<ShaderSource>, info: ProgramInfo) -> u64 {
        let key = info.source_hash;
        self.staged.lock().entry(key).or_insert((sources, info));
        key
    }

    /// Programs staged but not yet built.
    pub fn staged_len(&self) -> usize {
        self.staged.lock().len()
    }
}

impl<P: Clone + Send + Sync> Compiler<P> for ShaderCompiler<P> {
    fn compile(&self, key: u64, _mode: ExecMode) -> Result<Translated<P>, CompileError> {
        let Some((sources, info)) = self.staged.lock().get(&key).cloned() else {
            return Err(CompileError::Failed {
                addr: key,
                reason: "no sources staged for this hash".to_owned(),
            });
        };
        let program = self.backend.create_program(&sources, &info)?;
        self.staged.lock().remove(&key);
        // Hash-keyed artifacts occupy a unit range in the cache.
        Ok(Translated {
            artifact: program,
            size: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use hl_core::ShaderStage;

    use super::*;

    struct StubBackend;

    impl RenderBackend<String> for StubBackend {
        fn create_program(
            &self,
            sources: &[ShaderSource],
            info: &ProgramInfo,
        ) -> Result<String, CompileError> {
            if sources.is_empty() {
                return Err(CompileError::Failed {
                    addr: info.source_hash,
                    reason: "no stages".to_owned(),
                });
            }
            Ok(format!("program-{:x}-{}", info.source_hash, sources.len()))
        }
    }

    fn source(stage: ShaderStage) -> ShaderSource {
        ShaderSource {
            stage,
            code: vec![1, 2, 3],
        }
    }

    #[test]
    fn stage_then_compile_builds_and_unstages() {
        let compiler = ShaderCompiler::new(Arc::new(StubBackend));
        let key = compiler.stage(
            vec![source(ShaderStage::Vertex), source(ShaderStage::Fragment)],
            ProgramInfo {
                source_hash: 0xFEED,
                label: Some("ui".to_owned()),
            },
        );
        assert_eq!(key, 0xFEED);
        assert_eq!(compiler.staged_len(), 1);

        let translated = compiler.compile(key, ExecMode::Baseline).unwrap();
        assert_eq!(translated.artifact, "program-feed-2");
        assert_eq!(translated.size, 1);
        assert_eq!(compiler.staged_len(), 0);
    }

    #[test]
    fn compile_without_staging_is_a_typed_failure() {
        let compiler: ShaderCompiler<String> = ShaderCompiler::new(Arc::new(StubBackend));
        let err = compiler.compile(0x123, ExecMode::Baseline).unwrap_err();
        assert!(matches!(err, CompileError::Failed { addr: 0x123, .. }));
    }

    #[test]
    fn backend_errors_pass_through_and_keep_the_sources() {
        let compiler: ShaderCompiler<String> = ShaderCompiler::new(Arc::new(StubBackend));
        let key = compiler.stage(
            Vec::new(),
            ProgramInfo {
                source_hash: 0x42,
                label: None,
            },
        );
        assert!(compiler.compile(key, ExecMode::Baseline).is_err());
        // Still staged: a later retry may succeed (e.g. after a device reset).
        assert_eq!(compiler.staged_len(), 1);
    }
}
