//! Fixed-size executable code pages.
//!
//! [`CodePage`] is the only place that touches raw executable memory: a
//! single 4 KiB RWX page with a monotone write cursor, driven through the
//! [`DynasmApi`]/[`DynasmLabelApi`] traits so harness templates can be
//! written with `dynasm!` and opaque corpus bytes spliced with `.bytes`.
//!
//! Before every test the page is re-initialized: filled with `NOP` and
//! terminated with a final `RET` byte, so a stray jump past the emitted
//! epilogue still returns to the caller. Emitting more code than fits in
//! the page (keeping the trailing `RET` intact) is a fatal programming
//! error and panics.

use dynasmrt::components::{LabelRegistry, ManagedRelocs, PatchLoc, RelocRegistry, StaticLabel};
use dynasmrt::x64::X64Relocation;
use dynasmrt::{
    AssemblyOffset, DynamicLabel, DynasmApi, DynasmError, DynasmLabelApi, LabelKind, TargetKind,
};
use iced_x86::{Decoder, DecoderOptions, Formatter, Instruction, IntelFormatter};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};

use crate::harness::HarnessFn;

/// Size of a code page. The platform contract assumes 4 KiB pages.
pub const PAGE_SIZE: usize = 4096;

/// Single-byte NOP used for the page fill and baseline sleds.
pub const NOP: u8 = 0x90;

/// Near return; the last byte of every code page.
pub const RET: u8 = 0xc3;

/// One RWX page holding a generated harness.
///
/// Assembly is buffered in `ops` and written back to the page by
/// [`CodePage::commit`], after which [`CodePage::entry`] hands out a
/// callable function pointer.
pub struct CodePage {
    ptr: *mut u8,
    ops: Vec<u8>,
    labels: LabelRegistry,
    relocs: RelocRegistry<X64Relocation>,
    managed: ManagedRelocs<X64Relocation>,
    error: Option<DynasmError>,
    committed: bool,
}

impl CodePage {
    /// Map a fresh RWX page at a kernel-chosen address.
    pub fn new() -> Self {
        let ptr = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(PAGE_SIZE).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_ANONYMOUS | MapFlags::MAP_PRIVATE,
                -1,
                0,
            )
            .expect("couldn't map executable page")
        } as *mut u8;

        let mut page = Self {
            ptr,
            ops: Vec::with_capacity(PAGE_SIZE),
            labels: LabelRegistry::new(),
            relocs: RelocRegistry::new(),
            managed: ManagedRelocs::new(),
            error: None,
            committed: false,
        };
        page.reset();
        page
    }

    /// Re-initialize for the next harness: fill the page with `NOP`, pin
    /// the trailing `RET`, rewind the cursor and drop all label state.
    pub fn reset(&mut self) {
        let mem = unsafe { std::slice::from_raw_parts_mut(self.ptr, PAGE_SIZE) };
        mem.fill(NOP);
        mem[PAGE_SIZE - 1] = RET;

        self.ops.clear();
        self.labels = LabelRegistry::new();
        self.relocs = RelocRegistry::new();
        self.managed = ManagedRelocs::new();
        self.error = None;
        self.committed = false;
    }

    /// Base address of the page.
    pub fn base_addr(&self) -> usize {
        self.ptr as usize
    }

    /// Current write cursor (bytes emitted so far).
    pub fn cursor(&self) -> usize {
        self.ops.len()
    }

    /// Read back the page contents (test support / disassembly).
    pub fn page_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, PAGE_SIZE) }
    }

    fn overflow(&self, requested: usize) -> ! {
        panic!(
            "generated code exceeds page boundary ({}/{} at {:#x})",
            requested,
            PAGE_SIZE,
            self.base_addr()
        );
    }

    fn encode_relocs(&mut self) -> Result<(), DynasmError> {
        for (loc, label) in self.relocs.take_statics() {
            let target = self.labels.resolve_static(&label)?;
            let buf = &mut self.ops[loc.range(0)];
            if loc.patch(buf, self.ptr as usize, target.0).is_err() {
                return Err(DynasmError::ImpossibleRelocation(if label.is_global() {
                    TargetKind::Global(label.get_name())
                } else {
                    TargetKind::Local(label.get_name())
                }));
            }
            if loc.needs_adjustment() {
                self.managed.add(loc)
            }
        }
        for (loc, id) in self.relocs.take_dynamics() {
            let target = self.labels.resolve_dynamic(id)?;
            let buf = &mut self.ops[loc.range(0)];
            if loc.patch(buf, self.ptr as usize, target.0).is_err() {
                return Err(DynasmError::ImpossibleRelocation(TargetKind::Dynamic(id)));
            }
            if loc.needs_adjustment() {
                self.managed.add(loc)
            }
        }
        Ok(())
    }

    /// Resolve relocations and copy the assembled harness onto the page.
    pub fn commit(&mut self) {
        if let Some(e) = self.error.take() {
            panic!("assembly error while emitting harness: {}", e);
        }
        // The trailing RET must survive emission.
        if self.ops.len() >= PAGE_SIZE {
            self.overflow(self.ops.len());
        }
        self.encode_relocs()
            .expect("couldn't encode harness relocations");

        let dst = unsafe { std::slice::from_raw_parts_mut(self.ptr, self.ops.len()) };
        dst.copy_from_slice(&self.ops);
        self.committed = true;
    }

    /// Function pointer to the committed harness.
    pub fn entry(&self) -> HarnessFn {
        assert!(self.committed, "code page was not committed");
        unsafe { std::mem::transmute(self.ptr) }
    }

    /// Log the disassembly of the emitted harness (trace-level debugging).
    pub fn trace_disas(&self) {
        if !log::log_enabled!(log::Level::Trace) {
            return;
        }
        let addr = self.ptr as u64;
        let buf = &self.page_bytes()[..self.cursor()];
        let mut decoder = Decoder::with_ip(64, buf, addr, DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        let mut output = String::new();
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            output.clear();
            formatter.format(&instr, &mut output);
            log::trace!("{:016x}: {}", instr.ip(), output);
        }
    }
}

impl Drop for CodePage {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr as *mut std::ffi::c_void, PAGE_SIZE);
        }
    }
}

// The page is only ever driven from the executor's thread; the signal
// handler never touches CodePage state.
unsafe impl Send for CodePage {}

// Required for implementing [DynasmApi].
impl Extend<u8> for CodePage {
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = u8>,
    {
        for b in iter {
            self.push(b);
        }
    }
}
impl<'a> Extend<&'a u8> for CodePage {
    fn extend<T>(&mut self, iter: T)
    where
        T: IntoIterator<Item = &'a u8>,
    {
        for b in iter {
            self.push(*b);
        }
    }
}

impl DynasmApi for CodePage {
    fn offset(&self) -> AssemblyOffset {
        AssemblyOffset(self.ops.len())
    }

    fn push(&mut self, byte: u8) {
        // Reserve the final byte for the safety-net RET.
        if self.ops.len() + 1 >= PAGE_SIZE {
            self.overflow(self.ops.len() + 1);
        }
        self.ops.push(byte);
    }

    fn align(&mut self, alignment: usize, with: u8) {
        let misalign = self.offset().0 % alignment;
        if misalign != 0 {
            for _ in misalign..alignment {
                self.push(with);
            }
        }
    }
}

impl DynasmLabelApi for CodePage {
    type Relocation = X64Relocation;

    fn local_label(&mut self, name: &'static str) {
        let offset = self.offset();
        self.labels.define_local(name, offset);
    }

    fn global_label(&mut self, name: &'static str) {
        let offset = self.offset();
        if let Err(e) = self.labels.define_global(name, offset) {
            self.error = Some(e)
        }
    }

    fn dynamic_label(&mut self, id: DynamicLabel) {
        let offset = self.offset();
        if let Err(e) = self.labels.define_dynamic(id, offset) {
            self.error = Some(e)
        }
    }

    fn global_relocation(
        &mut self,
        name: &'static str,
        target_offset: isize,
        field_offset: u8,
        ref_offset: u8,
        kind: Self::Relocation,
    ) {
        let location = self.offset();
        let label = StaticLabel::global(name);
        self.relocs.add_static(
            label,
            PatchLoc::new(location, target_offset, field_offset, ref_offset, kind),
        );
    }

    fn dynamic_relocation(
        &mut self,
        id: DynamicLabel,
        target_offset: isize,
        field_offset: u8,
        ref_offset: u8,
        kind: Self::Relocation,
    ) {
        let location = self.offset();
        self.relocs.add_dynamic(
            id,
            PatchLoc::new(location, target_offset, field_offset, ref_offset, kind),
        );
    }

    fn forward_relocation(
        &mut self,
        name: &'static str,
        target_offset: isize,
        field_offset: u8,
        ref_offset: u8,
        kind: Self::Relocation,
    ) {
        let location = self.offset();
        let label = match self.labels.place_local_reference(name) {
            Some(label) => label.next(),
            None => StaticLabel::first(name),
        };
        self.relocs.add_static(
            label,
            PatchLoc::new(location, target_offset, field_offset, ref_offset, kind),
        );
    }

    fn backward_relocation(
        &mut self,
        name: &'static str,
        target_offset: isize,
        field_offset: u8,
        ref_offset: u8,
        kind: Self::Relocation,
    ) {
        let location = self.offset();
        let label = match self.labels.place_local_reference(name) {
            Some(label) => label,
            None => {
                self.error = Some(DynasmError::UnknownLabel(LabelKind::Local(name)));
                return;
            }
        };
        self.relocs.add_static(
            label,
            PatchLoc::new(location, target_offset, field_offset, ref_offset, kind),
        );
    }

    fn bare_relocation(
        &mut self,
        target: usize,
        field_offset: u8,
        ref_offset: u8,
        kind: Self::Relocation,
    ) {
        let location = self.offset();
        let loc = PatchLoc::new(location, 0, field_offset, ref_offset, kind);
        let buf = &mut self.ops[loc.range(0)];
        if loc.patch(buf, self.ptr as usize, target).is_err() {
            self.error = Some(DynasmError::ImpossibleRelocation(TargetKind::Extern(target)))
        } else if loc.needs_adjustment() {
            self.managed.add(loc)
        }
    }
}
