use crate::{CompileError, ExecMode};

/// A finished translation: the opaque artifact plus the guest range it
/// covers (`[addr, addr + size)` once registered).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translated<A> {
    pub artifact: A,

    /// Guest bytes covered by the artifact. Never zero.
    pub size: u64,
}

/// The external producer of translated artifacts.
///
/// Only one implementation exists in production; tests supply a scripted
/// mock. The artifact type `A` is opaque to the fabric, typically an
/// `Arc` over whatever the code generator emits.
pub trait Compiler<A>: Send + Sync {
    fn compile(&self, addr: u64, mode: ExecMode) -> Result<Translated<A>, CompileError>;
}

impl<A, F> Compiler<A> for F
where
    F: Fn(u64, ExecMode) -> Result<Translated<A>, CompileError> + Send + Sync,
{
    fn compile(&self, addr: u64, mode: ExecMode) -> Result<Translated<A>, CompileError> {
        self(addr, mode)
    }
}

/// Read-only view of guest memory, consumed by the bulk prewarm scan.
pub trait GuestMemory: Send + Sync {
    fn is_mapped(&self, addr: u64) -> bool;

    /// Reads a little-endian word. Callers must check [`Self::is_mapped`] first.
    fn read_u32(&self, addr: u64) -> u32;
}

// --- Renderer capability ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

/// One stage of a program, as handed to us by the guest.
#[derive(Clone, Debug)]
pub struct ShaderSource {
    pub stage: ShaderStage,
    pub code: Vec<u8>,
}

/// Link-time metadata for a program build.
#[derive(Clone, Debug, Default)]
pub struct ProgramInfo {
    /// Stable hash of all stage sources; doubles as the cache key.
    pub source_hash: u64,

    /// Human-readable label for logging.
    pub label: Option<String>,
}

/// The external GPU program builder, consumed by the shader-compile variant
/// of the worker pool.
pub trait RenderBackend<P>: Send + Sync {
    fn create_program(
        &self,
        sources: &[ShaderSource],
        info: &ProgramInfo,
    ) -> Result<P, CompileError>;
}
