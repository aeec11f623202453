//! Driving dyld4's just-in-time loader pipeline on arm64.
//!
//! There is no supported way to hand dyld a Mach-O that never touched disk,
//! so this module re-enters the linker through its private internals: it
//! resolves the mangled symbols of the just-in-time loader machinery from
//! the cached `/usr/lib/dyld`, mirrors the handful of private structures it
//! must share with them, and runs the make → dependents → fixups →
//! initializers sequence under dyld's own writable-state lock and protected
//! stack. Everything here is private ABI; when a layout moves, the symbol
//! resolution step is designed to fail fast rather than limp.

use std::ffi::{CStr, c_char, c_void};
use std::ptr::{self, NonNull};

use mach2::vm_types::mach_vm_address_t;

use crate::errors::LoadError;
use crate::macho::{self, MachHeader64};
use crate::regions::{Region, RegionArray, should_map};
use crate::shared_cache::SharedCache;

use super::sys;

// RuntimeState ("apis") field offsets.
const APIS_SYSCALL_DELEGATE: usize = 8;
const APIS_MAIN_IMAGE: usize = 24;
const APIS_LOADED_SET: usize = 32;
// lsl::MemoryManager field offsets.
const MM_WRITABLE_COUNTER: usize = 0x18;
const MM_PROTECTED_STACK: usize = 0x30;
// The Loader bitfield word and the lateLeaveMapped bit inside it.
const LOADER_FLAGS_WORD: usize = 16;
const LOADER_LATE_LEAVE_MAPPED: u64 = 1 << 21;

// dyld4::FileID
#[repr(C)]
struct FileId {
    inode: u64,
    mod_time: u64,
    is_valid: bool,
}

// dyld4::Loader::LoadChain
#[repr(C)]
struct LoadChain {
    previous: *const LoadChain,
    image: *const c_void,
}

// dyld4::Loader::LoadOptions. Only the named flags are ever set; the rest
// stay zero from the fresh scratch page.
#[repr(C)]
struct LoadOptions {
    launching: bool,
    static_linkage: bool,
    can_be_missing: bool,
    rtld_local: bool,
    rtld_no_delete: bool,
    rtld_no_load: bool,
    inserted_dylib: bool,
    can_be_dylib: bool,
    can_be_bundle: bool,
    can_be_executable: bool,
    force_unloadable: bool,
    use_fallback_paths: bool,
    rpath_stack: *const LoadChain,
    finder: *const c_void,
    path_not_found_handler: *const c_void,
}

// The loaded-loader vector embedded in RuntimeState at +32.
#[repr(C)]
struct LoadedSet {
    allocator: *const c_void,
    elements: *mut *mut c_void,
    size: usize,
    capacity: usize,
}

// dyld4::DyldCacheDataConstLazyScopedWriter
#[repr(C)]
struct CacheWriter {
    state: *mut c_void,
    was_made_writable: bool,
}

// lsl::MemoryManager::lockGuard() returns its guard by value through the
// hidden-pointer convention (x8 here). Reserving four words keeps our frame
// at least as large as the real guard; only the lock pointer is consumed.
#[repr(C)]
struct LockGuardRet {
    lock: *mut c_void,
    _pad: [u64; 3],
}

// Apple blocks ABI. The linker internals only ever invoke these
// synchronously, never copy them, so a stack literal with no copy/dispose
// helpers and an inline context is enough.
#[repr(C)]
struct BlockDescriptor {
    reserved: u64,
    size: u64,
}

#[repr(C)]
struct Block<T> {
    isa: *const c_void,
    flags: i32,
    reserved: i32,
    invoke: *const c_void,
    descriptor: *const BlockDescriptor,
    context: T,
}

type JitLoaderMake = unsafe extern "C" fn(
    *mut c_void,    // RuntimeState&
    *const c_void,  // MachOFile* (mapped address)
    *const c_char,  // path
    *const FileId,
    u64,            // sliceOffset
    bool,           // willNeverUnload
    bool,           // leaveMapped
    bool,           // overridesCache
    u16,            // overridesDylibIndex
    *const c_void,  // mach_o::Layout*
) -> *mut c_void;
type WithVmLayout = unsafe extern "C" fn(*const c_void, *mut c_void, *const c_void);
type AnalyzeSegmentsLayout = unsafe extern "C" fn(*const c_void, *mut u64, *mut bool);
type WithRegions = unsafe extern "C" fn(*const c_void, *const c_void);
type LoadDependents = unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, *const LoadOptions);
type ApplyFixups =
    unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_void, *mut CacheWriter, bool, *mut c_void);
type IncDlRefCount = unsafe extern "C" fn(*mut c_void, *mut c_void);
type RunInitializers = unsafe extern "C" fn(*mut c_void, *mut c_void);
type DiagMethod = unsafe extern "C" fn(*mut c_void);
type DiagHasError = unsafe extern "C" fn(*mut c_void) -> bool;
type MemoryManagerFn = unsafe extern "C" fn() -> *mut c_void;
type LockGuardFn = unsafe extern "C" fn(*mut c_void) -> LockGuardRet;
type WriteProtectFn = unsafe extern "C" fn(*mut c_void, bool);
type LockUnlockFn = unsafe extern "C" fn(*mut c_void);
type WithProtectedStackFn = unsafe extern "C" fn(*mut c_void, *const c_void);

const SYM_JIT_LOADER_MAKE: &CStr = c"__ZN5dyld416JustInTimeLoader4makeERNS_12RuntimeStateEPKN5dyld39MachOFileEPKcRKNS_6FileIDEybbbtPKN6mach_o6LayoutE";
const SYM_WITH_VM_LAYOUT: &CStr =
    c"__ZNK5dyld313MachOAnalyzer12withVMLayoutER11DiagnosticsU13block_pointerFvRKN6mach_o6LayoutEE";
const SYM_ANALYZE_SEGMENTS_LAYOUT: &CStr = c"__ZNK5dyld39MachOFile21analyzeSegmentsLayoutERyRb";
const SYM_WITH_REGIONS: &CStr =
    c"__ZN5dyld416JustInTimeLoader11withRegionsEPKN5dyld39MachOFileEU13block_pointerFvRKNS1_5ArrayINS_6Loader6RegionEEEE";
const SYM_LOAD_DEPENDENTS: &CStr =
    c"__ZN5dyld46Loader14loadDependentsER11DiagnosticsRNS_12RuntimeStateERKNS0_11LoadOptionsE";
const SYM_APPLY_FIXUPS: &CStr = c"__ZNK5dyld46Loader11applyFixupsER11DiagnosticsRNS_12RuntimeStateERNS_34DyldCacheDataConstLazyScopedWriterEbPN3lsl6VectorINSt3__14pairIPKS0_PKcEEEE";
const SYM_INC_DL_REF_COUNT: &CStr = c"__ZN5dyld412RuntimeState13incDlRefCountEPKNS_6LoaderE";
const SYM_RUN_INITIALIZERS: &CStr =
    c"__ZNK5dyld46Loader38runInitializersBottomUpPlusUpwardLinksERNS_12RuntimeStateE";
const SYM_DIAG_CTOR: &CStr = c"__ZN11DiagnosticsC1Ev";
const SYM_DIAG_CTOR_BASE: &CStr = c"__ZN11DiagnosticsC2Ev";
const SYM_DIAG_CLEAR_ERROR: &CStr = c"__ZN11Diagnostics10clearErrorEv";
const SYM_DIAG_HAS_ERROR: &CStr = c"__ZNK11Diagnostics8hasErrorEv";
const SYM_MEMORY_MANAGER: &CStr = c"__ZN3lsl13MemoryManager13memoryManagerEv";
const SYM_LOCK_GUARD: &CStr = c"__ZN3lsl13MemoryManager9lockGuardEv";
const SYM_WRITE_PROTECT: &CStr = c"__ZN3lsl13MemoryManager12writeProtectEb";
const SYM_LOCK_UNLOCK: &CStr = c"__ZN3lsl4Lock6unlockEv";
const SYM_WITH_PROTECTED_STACK: &CStr =
    c"__ZN3lsl14ProtectedStack18withProtectedStackEU13block_pointerFvvE";

/// Everything resolved out of the cached `/usr/lib/dyld`.
struct Internals {
    jit_loader_make: JitLoaderMake,
    with_vm_layout: WithVmLayout,
    analyze_segments_layout: AnalyzeSegmentsLayout,
    with_regions: WithRegions,
    load_dependents: LoadDependents,
    apply_fixups: ApplyFixups,
    inc_dl_ref_count: IncDlRefCount,
    run_initializers: RunInitializers,
    diag_construct: DiagMethod,
    diag_clear_error: DiagMethod,
    diag_has_error: DiagHasError,
    // The allocator-guard set is optional: without it the load still runs,
    // just without the outer wrapping.
    memory_manager: Option<MemoryManagerFn>,
    lock_guard: Option<LockGuardFn>,
    write_protect: Option<WriteProtectFn>,
    lock_unlock: Option<LockUnlockFn>,
    with_protected_stack: Option<WithProtectedStackFn>,
}

impl Internals {
    /// Resolves the pipeline against a live dyld image; any missing
    /// required symbol is a version-fingerprint mismatch and aborts.
    ///
    /// # Safety
    ///
    /// `dyld` must be the cached dyld image, valid once `slide` is applied.
    unsafe fn resolve(dyld: *const MachHeader64, slide: u64) -> Result<Self, LoadError> {
        // SAFETY: per contract
        unsafe {
            let required = || LoadError::MissingDyldInternals;
            Ok(Self {
                jit_loader_make: macho::find_function(dyld, SYM_JIT_LOADER_MAKE, slide).ok_or_else(required)?,
                with_vm_layout: macho::find_function(dyld, SYM_WITH_VM_LAYOUT, slide).ok_or_else(required)?,
                analyze_segments_layout: macho::find_function(dyld, SYM_ANALYZE_SEGMENTS_LAYOUT, slide)
                    .ok_or_else(required)?,
                with_regions: macho::find_function(dyld, SYM_WITH_REGIONS, slide).ok_or_else(required)?,
                load_dependents: macho::find_function(dyld, SYM_LOAD_DEPENDENTS, slide).ok_or_else(required)?,
                apply_fixups: macho::find_function(dyld, SYM_APPLY_FIXUPS, slide).ok_or_else(required)?,
                inc_dl_ref_count: macho::find_function(dyld, SYM_INC_DL_REF_COUNT, slide)
                    .ok_or_else(required)?,
                run_initializers: macho::find_function(dyld, SYM_RUN_INITIALIZERS, slide)
                    .ok_or_else(required)?,
                diag_construct: macho::find_function(dyld, SYM_DIAG_CTOR, slide)
                    .or_else(|| macho::find_function(dyld, SYM_DIAG_CTOR_BASE, slide))
                    .ok_or_else(required)?,
                diag_clear_error: macho::find_function(dyld, SYM_DIAG_CLEAR_ERROR, slide)
                    .ok_or_else(required)?,
                diag_has_error: macho::find_function(dyld, SYM_DIAG_HAS_ERROR, slide).ok_or_else(required)?,
                memory_manager: macho::find_function(dyld, SYM_MEMORY_MANAGER, slide),
                lock_guard: macho::find_function(dyld, SYM_LOCK_GUARD, slide),
                write_protect: macho::find_function(dyld, SYM_WRITE_PROTECT, slide),
                lock_unlock: macho::find_function(dyld, SYM_LOCK_UNLOCK, slide),
                with_protected_stack: macho::find_function(dyld, SYM_WITH_PROTECTED_STACK, slide),
            })
        }
    }
}

/// The scoped access to dyld's write-protected allocator state, when the
/// host still exports the pieces.
struct WritableState {
    memory_manager: *mut c_void,
    lock_guard: LockGuardFn,
    write_protect: WriteProtectFn,
    lock_unlock: LockUnlockFn,
}

impl WritableState {
    /// Under the manager's lock, bump the writable-state counter and flip
    /// the private heap RW on the 0→1 edge.
    unsafe fn enter(&self) {
        // SAFETY: resolved against the live dyld; counter offset is ABI
        unsafe {
            let guard = (self.lock_guard)(self.memory_manager);
            let counter = self.memory_manager.byte_add(MM_WRITABLE_COUNTER) as *mut u64;
            let mut c = *counter;
            if c == 0 {
                (self.write_protect)(self.memory_manager, false);
                c = *counter;
            }
            *counter = c + 1;
            (self.lock_unlock)(guard.lock);
        }
    }

    /// The symmetric decrement; back to RO on the 1→0 edge.
    unsafe fn exit(&self) {
        // SAFETY: as for enter
        unsafe {
            let guard = (self.lock_guard)(self.memory_manager);
            let counter = self.memory_manager.byte_add(MM_WRITABLE_COUNTER) as *mut u64;
            let c = *counter;
            if c != 0 {
                *counter = c - 1;
                if c == 1 {
                    (self.write_protect)(self.memory_manager, true);
                }
            }
            (self.lock_unlock)(guard.lock);
        }
    }
}

// Scratch-page overlay. One fresh (zeroed) 16 KiB page carries every
// structure whose address crosses into dyld, carved out by cursor
// arithmetic from the top.
const SCRATCH_SIZE: usize = 16 * 1024;
const TOP_LOADER_OFFSET: usize = 0;
const FILE_ID_OFFSET: usize = TOP_LOADER_OFFSET + size_of::<u64>();
const DIAG_OFFSET: usize = FILE_ID_OFFSET + size_of::<FileId>();
const DIAG_SIZE: usize = 0x200; // real Diagnostics is smaller; headroom is deliberate
const CHAIN_MAIN_OFFSET: usize = DIAG_OFFSET + DIAG_SIZE;
const CHAIN_CALLER_OFFSET: usize = CHAIN_MAIN_OFFSET + size_of::<LoadChain>();
const CHAIN_TOP_OFFSET: usize = CHAIN_CALLER_OFFSET + size_of::<LoadChain>();
const OPTIONS_OFFSET: usize = CHAIN_TOP_OFFSET + size_of::<LoadChain>();
const RESULT_OFFSET: usize = OPTIONS_OFFSET + size_of::<LoadOptions>();
const SCRATCH_END: usize = RESULT_OFFSET + size_of::<u64>();

const _: () = assert!(SCRATCH_END <= SCRATCH_SIZE);

struct Scratch {
    base: NonNull<u8>,
}

impl Scratch {
    fn alloc() -> Result<Self, LoadError> {
        // SAFETY: anonymous page request
        let base = unsafe { sys::anon_rw(SCRATCH_SIZE, 0) }.ok_or(LoadError::ScratchVmExhausted)?;
        Ok(Self { base })
    }

    fn at<T>(&self, offset: usize) -> *mut T {
        // SAFETY: every overlay offset is inside the page (const-checked)
        unsafe { self.base.as_ptr().add(offset).cast() }
    }

    fn top_loader(&self) -> *mut u64 {
        self.at(TOP_LOADER_OFFSET)
    }
    fn file_id(&self) -> *mut FileId {
        self.at(FILE_ID_OFFSET)
    }
    fn diag(&self) -> *mut c_void {
        self.at(DIAG_OFFSET)
    }
    fn chain_main(&self) -> *mut LoadChain {
        self.at(CHAIN_MAIN_OFFSET)
    }
    fn chain_caller(&self) -> *mut LoadChain {
        self.at(CHAIN_CALLER_OFFSET)
    }
    fn chain_top(&self) -> *mut LoadChain {
        self.at(CHAIN_TOP_OFFSET)
    }
    fn options(&self) -> *mut LoadOptions {
        self.at(OPTIONS_OFFSET)
    }
    fn result(&self) -> *mut u64 {
        self.at(RESULT_OFFSET)
    }
}

// Pipeline step outcomes stored in the scratch result slot; values align
// with the wire codes they become.
const RC_OK: u64 = 0;
const RC_LOADER_CONSTRUCTION: u64 = 8;
const RC_DEPENDENTS_OR_FIXUPS: u64 = 9;

/// The `__NSConcreteStackBlock` class pointer, for the block literals handed
/// to dyld. The internals never inspect it (they only invoke), so a missing
/// libsystem_blocks leaves it null rather than failing the load.
fn block_isa(cache: &SharedCache) -> *const c_void {
    let Some(base) = cache.image_header(c"/usr/lib/system/libsystem_blocks.dylib") else {
        return ptr::null();
    };
    // SAFETY: cache images are mapped
    unsafe { macho::find_symbol(base, c"__NSConcreteStackBlock", cache.slide()) }
        .map_or(ptr::null(), |p| p.as_ptr().cast_const())
}

struct RegionsCtx {
    payload: *const u8,
    load_address: mach_vm_address_t,
    vm_space: u64,
}

unsafe extern "C" fn copy_regions_invoke(block: *mut Block<RegionsCtx>, regions: *const RegionArray) {
    // SAFETY: invoked synchronously by withRegions with the array it built
    unsafe {
        let ctx = &(*block).context;
        let slice_offset = 0u64; // single pre-sliced image only
        let mut mapped = 0u32;
        for i in 0..(*regions).used_count {
            let region: &Region = &*(*regions).elements.add(i);
            if !should_map(region, mapped, ctx.vm_space) {
                continue;
            }
            let src = ctx
                .payload
                .add((slice_offset + u64::from(region.file_offset)) as usize);
            let dst = (ctx.load_address + region.vm_offset()) as *mut u8;
            macho::copy_bytes(src, dst, region.file_size as usize);
            sys::mprotect(dst.cast(), u64::from(region.file_size), region.prot());
            mapped += 1;
        }
    }
}

/// Copies every file-backed region into the reserved space and applies the
/// final page protections, in the order the linker produced them.
unsafe fn map_segments(
    internals: &Internals,
    isa: *const c_void,
    payload: &[u8],
    load_address: mach_vm_address_t,
    vm_space: u64,
) {
    let descriptor = BlockDescriptor {
        reserved: 0,
        size: size_of::<Block<RegionsCtx>>() as u64,
    };
    let block = Block {
        isa,
        flags: 0,
        reserved: 0,
        invoke: copy_regions_invoke as *const c_void,
        descriptor: &descriptor,
        context: RegionsCtx {
            payload: payload.as_ptr(),
            load_address,
            vm_space,
        },
    };
    // SAFETY: the block literal outlives the synchronous enumeration
    unsafe {
        (internals.with_regions)(payload.as_ptr().cast(), (&raw const block).cast());
    }
}

/// Everything the pipeline body needs once it may be running on dyld's
/// protected stack, where it must not touch anything but linker internals
/// and raw syscalls.
struct LoadCtx<'a> {
    internals: &'a Internals,
    apis: *mut c_void,
    scratch: &'a Scratch,
    load_address: mach_vm_address_t,
    isa: *const c_void,
}

struct MakeLoaderCtx<'a> {
    internals: &'a Internals,
    apis: *mut c_void,
    load_address: mach_vm_address_t,
    file_id: *const FileId,
    top_loader: *mut u64,
}

unsafe extern "C" fn make_loader_invoke(
    block: *mut Block<*const MakeLoaderCtx<'_>>,
    layout: *const c_void,
) {
    // SAFETY: invoked synchronously by withVMLayout
    unsafe {
        let ctx = &*(*block).context;
        let loader = (ctx.internals.jit_loader_make)(
            ctx.apis,
            ctx.load_address as *const c_void,
            c"A".as_ptr(),
            ctx.file_id,
            0,     // sliceOffset
            false, // willNeverUnload
            true,  // leaveMapped
            false, // overridesCache
            0,     // overridesDylibIndex
            layout,
        );
        *ctx.top_loader = loader as u64;
    }
}

unsafe extern "C" fn run_pipeline_invoke(block: *mut Block<*const LoadCtx<'_>>) {
    // SAFETY: invoked synchronously by withProtectedStack
    unsafe {
        let ctx = &*(*block).context;
        run_pipeline_locked(ctx);
    }
}

/// Pipeline body plus the writable-state scope around it.
unsafe fn run_pipeline_locked(ctx: &LoadCtx<'_>) {
    let internals = ctx.internals;
    let writable = internals
        .memory_manager
        .zip(internals.lock_guard)
        .zip(internals.write_protect)
        .zip(internals.lock_unlock)
        .and_then(|(((mm_fn, lock_guard), write_protect), lock_unlock)| {
            // SAFETY: resolved from the live dyld
            let memory_manager = unsafe { mm_fn() };
            if memory_manager.is_null() {
                return None;
            }
            Some(WritableState {
                memory_manager,
                lock_guard,
                write_protect,
                lock_unlock,
            })
        });

    // SAFETY: enter/exit bracket the pipeline on every path out of it
    unsafe {
        if let Some(ws) = &writable {
            ws.enter();
        }
        run_pipeline(ctx);
        if let Some(ws) = &writable {
            ws.exit();
        }
    }
}

/// MAKE_LOADER → LOAD_DEPS → FIXUPS → INIT_RUN, with a diagnostics check at
/// every join. Outcomes land in the scratch result slot; no Rust error can
/// cross this frame because it may be running on the linker's stack.
unsafe fn run_pipeline(ctx: &LoadCtx<'_>) {
    let internals = ctx.internals;
    let scratch = ctx.scratch;
    let diag = scratch.diag();

    // SAFETY: every pointer here is either scratch (ours) or dyld state the
    // resolved internals contractually accept
    unsafe {
        let loaded = ctx.apis.byte_add(APIS_LOADED_SET) as *mut LoadedSet;
        let first_new_loader = (*loaded).size;

        // MAKE_LOADER
        (internals.diag_clear_error)(diag);
        *scratch.top_loader() = 0;
        let make_ctx = MakeLoaderCtx {
            internals,
            apis: ctx.apis,
            load_address: ctx.load_address,
            file_id: scratch.file_id(),
            top_loader: scratch.top_loader(),
        };
        let descriptor = BlockDescriptor {
            reserved: 0,
            size: size_of::<Block<*const MakeLoaderCtx<'_>>>() as u64,
        };
        let block = Block {
            isa: ctx.isa,
            flags: 0,
            reserved: 0,
            invoke: make_loader_invoke as *const c_void,
            descriptor: &descriptor,
            context: &raw const make_ctx,
        };
        (internals.with_vm_layout)(ctx.load_address as *const c_void, diag, (&raw const block).cast());

        let top_loader = *scratch.top_loader() as *mut c_void;
        if top_loader.is_null() || (internals.diag_has_error)(diag) {
            *scratch.result() = RC_LOADER_CONSTRUCTION;
            return;
        }

        // The linker must never unmap this image behind us, success or not.
        *(top_loader.byte_add(LOADER_FLAGS_WORD) as *mut u64) |= LOADER_LATE_LEAVE_MAPPED;

        // Simulated provenance: main executable → initial caller → payload.
        *scratch.chain_main() = LoadChain {
            previous: ptr::null(),
            image: *(ctx.apis.byte_add(APIS_MAIN_IMAGE) as *const *const c_void),
        };
        *scratch.chain_caller() = LoadChain {
            previous: scratch.chain_main(),
            image: (*loaded).elements.cast(),
        };
        *scratch.chain_top() = LoadChain {
            previous: scratch.chain_caller(),
            image: top_loader,
        };

        let options = scratch.options();
        (*options).rtld_no_delete = true;
        (*options).can_be_dylib = true;
        (*options).use_fallback_paths = true;
        (*options).rpath_stack = scratch.chain_top();

        // LOAD_DEPS
        (internals.diag_clear_error)(diag);
        (internals.load_dependents)(top_loader, diag, ctx.apis, options);
        if (internals.diag_has_error)(diag) {
            *scratch.result() = RC_DEPENDENTS_OR_FIXUPS;
            return;
        }

        // FIXUPS, only over the loaders this call appended.
        let mut writer = CacheWriter {
            state: ctx.apis,
            was_made_writable: false,
        };
        for i in first_new_loader..(*loaded).size {
            let loader = *(*loaded).elements.add(i);
            (internals.apply_fixups)(loader, diag, ctx.apis, &mut writer, true, ptr::null_mut());
        }
        if (internals.diag_has_error)(diag) {
            *scratch.result() = RC_DEPENDENTS_OR_FIXUPS;
            return;
        }

        // INIT_RUN
        (internals.inc_dl_ref_count)(ctx.apis, top_loader);
        (internals.run_initializers)(top_loader, ctx.apis);

        *scratch.top_loader() = top_loader as u64;
        *scratch.result() = RC_OK;
    }
}

/// Maps the staged payload and drives it through dyld's just-in-time loader.
/// Returns the image's load address; the caller resolves and invokes the
/// entry symbol.
///
/// # Safety
///
/// `dyld` and `libdyld` must be images of `cache`; `payload` must be a
/// complete 64-bit Mach-O. Single caller per process at a time.
pub(super) unsafe fn load(
    cache: &SharedCache,
    dyld: *const MachHeader64,
    libdyld: *const MachHeader64,
    payload: &[u8],
) -> Result<mach_vm_address_t, LoadError> {
    let slide = cache.slide();

    // libdyld publishes the RuntimeState pointer in a one-slot section.
    // SAFETY: cache images are mapped; the section holds a pointer
    let apis = unsafe {
        let slot = macho::find_section(libdyld, b"__TPRO_CONST", b"__dyld_apis", slide)
            .ok_or(LoadError::RuntimeStateUnavailable)?;
        *(slot.as_ptr() as *const *mut c_void)
    };
    if apis.is_null() {
        return Err(LoadError::RuntimeStateUnavailable);
    }
    // SAFETY: RuntimeState layout, delegate slot at +8
    let syscall_delegate = unsafe { *(apis.byte_add(APIS_SYSCALL_DELEGATE) as *const *mut c_void) };
    if syscall_delegate.is_null() {
        return Err(LoadError::RuntimeStateUnavailable);
    }

    // SAFETY: dyld is the cached linker image
    let internals = unsafe { Internals::resolve(dyld, slide)? };
    let isa = block_isa(cache);
    log::debug!("dyld4 internals resolved; block isa {:p}", isa);

    // How much contiguous VM the image spans once mapped.
    let mut vm_space: u64 = 0;
    let mut has_zero_fill = false;
    // SAFETY: payload is a complete file image
    unsafe {
        (internals.analyze_segments_layout)(
            payload.as_ptr().cast(),
            &mut vm_space,
            &mut has_zero_fill,
        );
    }
    if vm_space == 0 {
        return Err(LoadError::EmptySegmentLayout);
    }

    // SAFETY: fresh anonymous reservation; MAP_JIT because segment spans
    // will become executable under a hardened runtime
    let load_address = unsafe { sys::anon_rw(vm_space as usize, libc::MAP_JIT) }
        .ok_or(LoadError::PayloadVmExhausted)?
        .as_ptr() as u64;

    // SAFETY: reservation covers vm_space; payload outlives the call
    unsafe {
        map_segments(&internals, isa, payload, load_address, vm_space);
    }

    let scratch = Scratch::alloc()?;
    // SAFETY: the page is fresh and zeroed; FileID stays invalid, the
    // diagnostics object needs its real constructor
    unsafe {
        (*scratch.file_id()).is_valid = false;
        (internals.diag_construct)(scratch.diag());
        *scratch.result() = RC_OK;
    }

    let load_ctx = LoadCtx {
        internals: &internals,
        apis,
        scratch: &scratch,
        load_address,
        isa,
    };

    // The whole pipeline prefers to run on the stack dyld trusts for its
    // internals; without that primitive it runs right here.
    // SAFETY: memory manager and trampoline resolved from the live dyld
    unsafe {
        let protected_stack = internals
            .memory_manager
            .map(|mm_fn| mm_fn())
            .filter(|mm| !mm.is_null())
            .map(|mm| *(mm.byte_add(MM_PROTECTED_STACK) as *const *mut c_void))
            .filter(|ps| !ps.is_null());

        match (protected_stack, internals.with_protected_stack) {
            (Some(stack), Some(trampoline)) => {
                let descriptor = BlockDescriptor {
                    reserved: 0,
                    size: size_of::<Block<*const LoadCtx<'_>>>() as u64,
                };
                let block = Block {
                    isa,
                    flags: 0,
                    reserved: 0,
                    invoke: run_pipeline_invoke as *const c_void,
                    descriptor: &descriptor,
                    context: &raw const load_ctx,
                };
                trampoline(stack, (&raw const block).cast());
            }
            _ => run_pipeline_locked(&load_ctx),
        }
    }

    // SAFETY: scratch is ours
    let (result, top_loader) = unsafe { (*scratch.result(), *scratch.top_loader()) };
    match result {
        RC_OK => {}
        RC_DEPENDENTS_OR_FIXUPS => return Err(LoadError::DependentsOrFixups),
        _ => return Err(LoadError::LoaderConstruction),
    }
    if top_loader == 0 {
        return Err(LoadError::LoaderConstruction);
    }

    log::debug!("payload mapped at {load_address:#x}");
    Ok(load_address)
}
