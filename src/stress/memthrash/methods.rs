//! Memory access patterns
//!
//! Every method hammers the first `mem_size` bytes of a region shared by all
//! workers of an instance. Workers never coordinate: they race on the same
//! cache lines on purpose. The region is viewed as relaxed atomics, which keeps
//! the races defined while still compiling to plain loads and stores.

use crate::config::types::{Result, StressError};
use crate::core::run_control::RunControl;
use crate::kernel::mman::{page_size, SharedMapping};
use crate::utils::cpu::monotonic_now;
use crate::utils::rng::StressRng;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

pub const MATRIX_SIZE_MIN_SHIFT: u32 = 10;
pub const MATRIX_SIZE_MAX_SHIFT: u32 = 14;
pub const MATRIX_SIZE: usize = 1 << MATRIX_SIZE_MAX_SHIFT;

/// Region size covering the largest scale (256 MiB)
pub const MEM_SIZE: usize = MATRIX_SIZE * MATRIX_SIZE;

/// Minimum time `all` spends in each method before moving on
const ALL_SLICE: Duration = Duration::from_millis(10);

/// Iterations of the spin methods per invocation
const SPIN_LOOPS: u32 = 65536;

/// Atomic increments per `lock` invocation
const LOCK_LOOPS: u32 = 64;

/// Working-set sizes, one per power-of-two linear scale
pub fn scales() -> impl Iterator<Item = usize> {
    (MATRIX_SIZE_MIN_SHIFT..=MATRIX_SIZE_MAX_SHIFT).map(|shift| 1usize << (2 * shift))
}

/// One anonymous shared mapping all workers of an instance thrash
#[derive(Debug)]
pub struct MemoryRegion {
    map: SharedMapping,
}

impl MemoryRegion {
    /// Region sized for the largest scale
    pub fn new() -> Result<Self> {
        Self::with_len(MEM_SIZE)
    }

    /// Smaller regions clamp every working set to their length
    pub fn with_len(len: usize) -> Result<Self> {
        if len % 8 != 0 {
            return Err(StressError::Config(format!(
                "memory region length {} is not a multiple of 8",
                len
            )));
        }
        Ok(Self {
            map: SharedMapping::new(len)?,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn bytes(&self) -> &[AtomicU8] {
        // SAFETY: the mapping is live for the lifetime of self, zero-initialised,
        // and AtomicU8 has the layout of u8.
        unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU8, self.len()) }
    }

    pub fn words(&self) -> &[AtomicU64] {
        // SAFETY: as for bytes(); the mapping is page-aligned and its length is a
        // multiple of 8.
        unsafe {
            std::slice::from_raw_parts(self.map.as_ptr() as *const AtomicU64, self.len() / 8)
        }
    }

    fn word32(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offset is 4-aligned and offset + 4 <= len, checked by the caller
        // through the clamped working set.
        unsafe { &*(self.map.as_ptr().add(offset) as *const AtomicU32) }
    }

    /// Square matrix dimension the region can hold, up to MATRIX_SIZE
    fn matrix_dim(&self) -> usize {
        let mut dim = MATRIX_SIZE;
        while dim * dim > self.len() {
            dim >>= 1;
        }
        dim
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    All,
    Chunk1,
    Chunk8,
    Chunk64,
    Chunk256,
    ChunkPage,
    Flip,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Flush,
    Lock,
    Matrix,
    Memset,
    Mfence,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Prefetch,
    Random,
    SpinRead,
    SpinWrite,
}

/// Every method compiled in for this target, in lookup order
pub const CATALOGUE: &[Method] = &[
    Method::All,
    Method::Chunk1,
    Method::Chunk8,
    Method::Chunk64,
    Method::Chunk256,
    Method::ChunkPage,
    Method::Flip,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Method::Flush,
    Method::Lock,
    Method::Matrix,
    Method::Memset,
    Method::Mfence,
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    Method::Prefetch,
    Method::Random,
    Method::SpinRead,
    Method::SpinWrite,
];

/// Position of `all` in its walk over the concrete methods, shared by every
/// worker of the process.
static ALL_CURSOR: AtomicUsize = AtomicUsize::new(0);

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Chunk1 => "chunk1",
            Self::Chunk8 => "chunk8",
            Self::Chunk64 => "chunk64",
            Self::Chunk256 => "chunk256",
            Self::ChunkPage => "chunkpage",
            Self::Flip => "flip",
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Flush => "flush",
            Self::Lock => "lock",
            Self::Matrix => "matrix",
            Self::Memset => "memset",
            Self::Mfence => "mfence",
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Prefetch => "prefetch",
            Self::Random => "random",
            Self::SpinRead => "spinread",
            Self::SpinWrite => "spinwrite",
        }
    }

    /// Descriptive alias accepted on lookup
    pub fn alias(self) -> Option<&'static str> {
        Some(match self {
            Self::All => "full-catalogue",
            Self::Memset => "full-fill",
            Self::Flip => "word-flip",
            Self::Matrix => "matrix-transpose",
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Flush => "cache-flush",
            Self::Mfence => "memory-fence",
            Self::Lock => "atomic-lock",
            Self::SpinRead => "spin-read",
            Self::SpinWrite => "spin-write",
            _ => return None,
        })
    }

    /// Look a method up by canonical name or alias
    pub fn from_name(name: &str) -> Result<Self> {
        CATALOGUE
            .iter()
            .copied()
            .find(|m| m.name() == name || m.alias() == Some(name))
            .ok_or_else(|| {
                let names: Vec<&str> = CATALOGUE.iter().map(|m| m.name()).collect();
                StressError::Config(format!(
                    "memthrash-method must be one of: {}",
                    names.join(" ")
                ))
            })
    }

    /// Methods that dispatch to other methods
    pub fn is_meta(self) -> bool {
        matches!(self, Self::All | Self::Random)
    }

    /// Catalogue entries that touch memory themselves
    pub fn concrete() -> impl Iterator<Item = Method> {
        CATALOGUE.iter().copied().filter(|m| !m.is_meta())
    }

    /// First concrete entry; the default selection
    pub fn default_method() -> Self {
        Self::Chunk1
    }

    /// Run once over the first `mem_size` bytes of `region`, stopping early
    /// when `stop` is flipped.
    pub fn run(self, region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
        let mem_size = mem_size.min(region.len());
        if mem_size == 0 {
            return;
        }
        match self {
            Self::All => run_all(region, mem_size, rng, stop),
            Self::Random => run_random(region, mem_size, rng, stop),
            Self::Chunk1 => random_chunk(region, 1, mem_size, rng, stop),
            Self::Chunk8 => random_chunk(region, 8, mem_size, rng, stop),
            Self::Chunk64 => random_chunk(region, 64, mem_size, rng, stop),
            Self::Chunk256 => random_chunk(region, 256, mem_size, rng, stop),
            Self::ChunkPage => random_chunk(region, page_size(), mem_size, rng, stop),
            Self::Flip => flip(region, mem_size),
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Flush => flush(region, mem_size, rng, stop),
            Self::Lock => lock(region, mem_size, rng, stop),
            Self::Matrix => matrix(region, rng, stop),
            Self::Memset => memset(region, mem_size, rng),
            Self::Mfence => mfence(region, mem_size, rng, stop),
            #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
            Self::Prefetch => prefetch(region, mem_size, rng, stop),
            Self::SpinRead => spin_read(region, mem_size, rng, stop),
            Self::SpinWrite => spin_write(region, mem_size, rng, stop),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn splat(byte: u8) -> u64 {
    u64::from_ne_bytes([byte; 8])
}

fn fill(region: &MemoryRegion, offset: usize, len: usize, byte: u8) {
    if offset % 8 == 0 && len % 8 == 0 {
        let word = splat(byte);
        for w in &region.words()[offset / 8..(offset + len) / 8] {
            w.store(word, Ordering::Relaxed);
        }
    } else {
        for b in &region.bytes()[offset..offset + len] {
            b.store(byte, Ordering::Relaxed);
        }
    }
}

fn random_offset(rng: &mut StressRng, mem_size: usize) -> usize {
    rng.mwc32() as usize % mem_size
}

fn random_chunk(
    region: &MemoryRegion,
    chunk_size: usize,
    mem_size: usize,
    rng: &mut StressRng,
    stop: &RunControl,
) {
    let chunk_size = chunk_size.min(mem_size);
    let chunks = (mem_size / chunk_size).max(1);
    let max = rng.mwc16();

    for _ in 0..max {
        if !stop.keep_running() {
            break;
        }
        let offset = (rng.mwc32() as usize % chunks) * chunk_size;
        fill(region, offset, chunk_size, rng.mwc8());
    }
}

fn memset(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng) {
    fill(region, 0, mem_size & !7, rng.mwc8());
}

fn flip(region: &MemoryRegion, mem_size: usize) {
    for w in &region.words()[..mem_size / 8] {
        w.store(!w.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

fn matrix(region: &MemoryRegion, rng: &mut StressRng, stop: &RunControl) {
    let dim = region.matrix_dim();
    let mem = region.bytes();
    let mut i = 0;

    while i < dim && stop.keep_running() {
        for j in (0..dim).step_by(16) {
            let a = &mem[i * dim + j];
            let b = &mem[j * dim + i];
            let tmp = a.load(Ordering::Relaxed);
            a.store(b.load(Ordering::Relaxed), Ordering::Relaxed);
            b.store(tmp, Ordering::Relaxed);
        }
        i += (rng.mwc8() & 0xf) as usize + 1;
    }
}

#[cfg(target_arch = "x86")]
use core::arch::x86 as arch;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch;

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn prefetch(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let mem = region.bytes();
    for i in 0..rng.mwc16() {
        if !stop.keep_running() {
            break;
        }
        let byte = &mem[random_offset(rng, mem_size)];
        // SAFETY: prefetch is a hint on a mapped address; it cannot fault.
        unsafe { arch::_mm_prefetch::<{ arch::_MM_HINT_T2 }>(byte.as_ptr() as *const i8) };
        byte.store(i as u8, Ordering::Relaxed);
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn flush(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let mem = region.bytes();
    for i in 0..rng.mwc16() {
        if !stop.keep_running() {
            break;
        }
        let byte = &mem[random_offset(rng, mem_size)];
        byte.store(i as u8, Ordering::Relaxed);
        // SAFETY: clflush on a mapped, writable address.
        unsafe { arch::_mm_clflush(byte.as_ptr() as *const u8) };
    }
}

fn mfence(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let mem = region.bytes();
    for i in 0..rng.mwc16() {
        if !stop.keep_running() {
            break;
        }
        mem[random_offset(rng, mem_size)].store(i as u8, Ordering::Relaxed);
        fence(Ordering::SeqCst);
    }
}

fn lock(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let mem = region.bytes();
    for _ in 0..LOCK_LOOPS {
        if !stop.keep_running() {
            break;
        }
        mem[random_offset(rng, mem_size)].fetch_add(1, Ordering::SeqCst);
    }
}

/// 4-aligned offset of one 32-bit word inside the working set
fn spin_target(rng: &mut StressRng, mem_size: usize) -> Option<usize> {
    if mem_size < 4 {
        return None;
    }
    Some(random_offset(rng, mem_size - 3) & !3)
}

fn spin_read(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let Some(offset) = spin_target(rng, mem_size) else {
        return;
    };
    let word = region.word32(offset);
    for _ in 0..SPIN_LOOPS {
        if !stop.keep_running() {
            break;
        }
        for _ in 0..8 {
            std::hint::black_box(word.load(Ordering::Relaxed));
        }
    }
}

fn spin_write(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let Some(offset) = spin_target(rng, mem_size) else {
        return;
    };
    let word = region.word32(offset);
    for i in 0..SPIN_LOOPS {
        if !stop.keep_running() {
            break;
        }
        for _ in 0..8 {
            word.store(i, Ordering::Relaxed);
        }
    }
}

/// Method a `random` draw lands on; `None` when the draw hits a meta-method
/// and has to be redrawn.
fn pick_random(draw: u8) -> Option<Method> {
    let method = CATALOGUE[draw as usize % CATALOGUE.len()];
    (!method.is_meta()).then_some(method)
}

/// Delegate to a uniformly chosen concrete method
fn run_random(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    loop {
        if let Some(method) = pick_random(rng.mwc8()) {
            method.run(region, mem_size, rng, stop);
            return;
        }
    }
}

fn concrete_count() -> usize {
    Method::concrete().count()
}

/// Concrete method the `all` walk runs at `cursor`
fn method_at(cursor: usize) -> Method {
    Method::concrete()
        .nth(cursor % concrete_count())
        .unwrap_or_else(Method::default_method)
}

/// Run the method under the cursor for at least one time slice, then advance
fn run_all(region: &MemoryRegion, mem_size: usize, rng: &mut StressRng, stop: &RunControl) {
    let cursor = ALL_CURSOR.load(Ordering::Relaxed) % concrete_count();
    let method = method_at(cursor);
    let start = monotonic_now();

    loop {
        method.run(region, mem_size, rng, stop);
        if !stop.keep_running() || monotonic_now().saturating_sub(start) >= ALL_SLICE {
            break;
        }
    }

    ALL_CURSOR.store((cursor + 1) % concrete_count(), Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_region() -> MemoryRegion {
        MemoryRegion::with_len(1 << 20).unwrap()
    }

    #[test]
    fn scales_are_quadratic_powers_of_two() {
        let sizes: Vec<usize> = scales().collect();
        assert_eq!(sizes, vec![1 << 20, 1 << 22, 1 << 24, 1 << 26, 1 << 28]);
        assert_eq!(*sizes.last().unwrap(), MEM_SIZE);
    }

    #[test]
    fn lookup_accepts_names_and_aliases() {
        assert_eq!(Method::from_name("memset").unwrap(), Method::Memset);
        assert_eq!(Method::from_name("full-fill").unwrap(), Method::Memset);
        assert_eq!(Method::from_name("full-catalogue").unwrap(), Method::All);
        assert_eq!(Method::from_name("spin-write").unwrap(), Method::SpinWrite);
        for method in CATALOGUE {
            assert_eq!(Method::from_name(method.name()).unwrap(), *method);
        }
    }

    #[test]
    fn unknown_method_lists_catalogue() {
        let err = Method::from_name("bogus").unwrap_err().to_string();
        assert!(err.contains("all chunk1 chunk8"), "{}", err);
        assert!(err.contains("spinwrite"), "{}", err);
    }

    #[test]
    fn default_is_first_concrete_entry() {
        assert_eq!(Method::concrete().next(), Some(Method::default_method()));
        assert!(Method::concrete().all(|m| !m.is_meta()));
    }

    #[test]
    fn memset_fills_working_set_only() {
        let region = small_region();
        let mut rng = StressRng::seeded(1);
        Method::Memset.run(&region, 4096, &mut rng, &RunControl::new());
        let mem = region.bytes();
        let byte = mem[0].load(Ordering::Relaxed);
        assert!(mem[..4096].iter().all(|b| b.load(Ordering::Relaxed) == byte));
        assert!(mem[4096..].iter().all(|b| b.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn flip_twice_restores_contents() {
        let region = small_region();
        Method::Flip.run(&region, 1 << 20, &mut StressRng::seeded(2), &RunControl::new());
        assert!(region.words().iter().all(|w| w.load(Ordering::Relaxed) == u64::MAX));
        Method::Flip.run(&region, 1 << 20, &mut StressRng::seeded(2), &RunControl::new());
        assert!(region.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn working_set_is_clamped_to_region() {
        let region = small_region();
        let mut rng = StressRng::seeded(3);
        let stop = RunControl::new();
        for method in CATALOGUE {
            method.run(&region, MEM_SIZE, &mut rng, &stop);
        }
    }

    #[test]
    fn stopped_methods_return_promptly() {
        let region = small_region();
        let stop = RunControl::new();
        stop.request_stop();
        let start = std::time::Instant::now();
        let mut rng = StressRng::seeded(4);
        for method in [Method::All, Method::SpinRead, Method::SpinWrite, Method::Chunk1] {
            method.run(&region, 1 << 20, &mut rng, &stop);
        }
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn lock_increments_without_loss() {
        let region = MemoryRegion::with_len(8).unwrap();
        let mut rng = StressRng::seeded(5);
        Method::Lock.run(&region, 1, &mut rng, &RunControl::new());
        assert_eq!(region.bytes()[0].load(Ordering::Relaxed), LOCK_LOOPS as u8);
    }

    #[test]
    fn all_advances_its_cursor() {
        let region = small_region();
        let mut rng = StressRng::seeded(6);
        let before = ALL_CURSOR.load(Ordering::Relaxed);
        Method::All.run(&region, 4096, &mut rng, &RunControl::new());
        assert_ne!(ALL_CURSOR.load(Ordering::Relaxed), before);
    }

    #[test]
    fn random_never_lands_on_a_meta_method() {
        let mut reached = std::collections::HashSet::new();
        for draw in 0..=u8::MAX {
            match pick_random(draw) {
                Some(method) => {
                    assert!(!method.is_meta(), "draw {} picked {}", draw, method);
                    reached.insert(method);
                }
                None => assert!(CATALOGUE[draw as usize % CATALOGUE.len()].is_meta()),
            }
        }
        assert_eq!(reached.len(), concrete_count());
    }

    #[test]
    fn all_cycles_through_every_concrete_method() {
        let count = concrete_count();
        let cycle: Vec<Method> = (0..count).map(method_at).collect();
        assert!(cycle.iter().all(|m| !m.is_meta()));
        assert_eq!(cycle, Method::concrete().collect::<Vec<_>>());

        // The cursor wraps back to the start of the walk.
        assert_eq!(method_at(count), cycle[0]);
        assert!((0..4 * count).map(method_at).all(|m| !m.is_meta()));
    }
}
