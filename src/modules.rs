use std::ffi::CStr;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::OnceLock;

use gimli::{BaseAddresses, EhFrameHdr, NativeEndian, Pointer};
use tracing::{debug, trace};

use crate::unwinder::{Module, SectionAddresses, UnwindData};
use crate::UnwinderNative;

/// An object mapped into this process, as reported by the dynamic loader.
#[derive(Debug, Clone)]
pub struct LoadedObject {
    /// Empty for the main executable.
    pub name: String,
    /// The difference between runtime addresses and the object's link-time addresses.
    pub bias: u64,
    /// The runtime range covered by the executable segments.
    pub text: Range<u64>,
    pub(crate) segments: Vec<Range<u64>>,
    pub(crate) eh_frame_hdr: Option<Range<u64>>,
}

impl LoadedObject {
    /// The file to read symbols from. The main executable is opened through
    /// /proc, the vDSO has no file.
    pub fn path(&self) -> Option<PathBuf> {
        if self.name.is_empty() {
            Some(PathBuf::from("/proc/self/exe"))
        } else if self.name.starts_with('/') {
            Some(PathBuf::from(&self.name))
        } else {
            None
        }
    }

    /// The name for diagnostics.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            "<main executable>"
        } else {
            &self.name
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        self.text.contains(&address)
    }
}

/// Lists the objects currently loaded into the process that have executable code.
pub fn loaded_objects() -> Vec<LoadedObject> {
    let mut objects: Vec<LoadedObject> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(collect_object),
            &mut objects as *mut Vec<LoadedObject> as *mut libc::c_void,
        );
    }
    objects.retain(|object| !object.text.is_empty());
    objects
}

unsafe extern "C" fn collect_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let objects = &mut *(data as *mut Vec<LoadedObject>);
    let info = &*info;
    let bias = info.dlpi_addr as u64;
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };
    let phdrs: &[libc::Elf64_Phdr] = if info.dlpi_phdr.is_null() {
        &[]
    } else {
        std::slice::from_raw_parts(info.dlpi_phdr as *const _, info.dlpi_phnum as usize)
    };

    let mut text_start = u64::MAX;
    let mut text_end = 0;
    let mut segments = Vec::new();
    let mut eh_frame_hdr = None;
    for phdr in phdrs {
        let start = bias.wrapping_add(phdr.p_vaddr);
        let range = start..start.wrapping_add(phdr.p_memsz);
        match phdr.p_type {
            libc::PT_LOAD => {
                if phdr.p_flags & libc::PF_X != 0 {
                    text_start = text_start.min(range.start);
                    text_end = text_end.max(range.end);
                }
                segments.push(range);
            }
            libc::PT_GNU_EH_FRAME => eh_frame_hdr = Some(range),
            _ => {}
        }
    }

    objects.push(LoadedObject {
        name,
        bias,
        text: if text_start < text_end {
            text_start..text_end
        } else {
            0..0
        },
        segments,
        eh_frame_hdr,
    });
    0
}

impl LoadedObject {
    fn segment_containing(&self, address: u64) -> Option<&Range<u64>> {
        self.segments.iter().find(|segment| segment.contains(&address))
    }

    /// Builds an unwinder module over this object's mapped `.eh_frame_hdr`
    /// and `.eh_frame`.
    pub fn to_module(&self) -> Module<&'static [u8]> {
        let (sections, unwind_data) = match self.unwind_sections() {
            Some((sections, eh_frame_hdr, eh_frame)) => (
                sections,
                UnwindData::EhFrameHdrAndEhFrame(eh_frame_hdr, eh_frame),
            ),
            None => {
                debug!("No usable unwind info in {}", self.display_name());
                let sections = SectionAddresses {
                    text: self.text.start,
                    eh_frame: 0,
                    eh_frame_hdr: 0,
                };
                (sections, UnwindData::None)
            }
        };
        Module::new(
            self.display_name().to_string(),
            self.text.clone(),
            self.bias,
            sections,
            unwind_data,
        )
    }

    fn unwind_sections(&self) -> Option<(SectionAddresses, &'static [u8], &'static [u8])> {
        let hdr_range = self.eh_frame_hdr.clone()?;
        // SAFETY: the loader keeps PT_GNU_EH_FRAME mapped while the object is loaded.
        let eh_frame_hdr: &'static [u8] = unsafe {
            std::slice::from_raw_parts(
                hdr_range.start as *const u8,
                (hdr_range.end - hdr_range.start) as usize,
            )
        };

        let bases = BaseAddresses::default().set_eh_frame_hdr(hdr_range.start);
        let parsed = EhFrameHdr::new(eh_frame_hdr, NativeEndian)
            .parse(&bases, 8)
            .ok()?;
        let eh_frame_address = match parsed.eh_frame_ptr() {
            Pointer::Direct(address) => address,
            Pointer::Indirect(_) => {
                trace!("Indirect eh_frame pointer in {}", self.display_name());
                return None;
            }
        };

        // .eh_frame has no size in the header; it runs at most to the end of
        // the segment that contains it.
        let segment = self.segment_containing(eh_frame_address)?;
        // SAFETY: the range lies within a mapped PT_LOAD segment.
        let eh_frame: &'static [u8] = unsafe {
            std::slice::from_raw_parts(
                eh_frame_address as *const u8,
                (segment.end - eh_frame_address) as usize,
            )
        };

        let sections = SectionAddresses {
            text: self.text.start,
            eh_frame: eh_frame_address,
            eh_frame_hdr: hdr_range.start,
        };
        Some((sections, eh_frame_hdr, eh_frame))
    }
}

/// The process-wide unwinder over all objects loaded at the time of first use.
pub fn process_unwinder() -> &'static UnwinderNative<&'static [u8]> {
    static UNWINDER: OnceLock<UnwinderNative<&'static [u8]>> = OnceLock::new();
    UNWINDER.get_or_init(|| {
        let mut unwinder = UnwinderNative::new();
        for object in loaded_objects() {
            trace!(
                "Adding module {} at 0x{:x}..0x{:x}",
                object.display_name(),
                object.text.start,
                object.text.end
            );
            unwinder.add_module(object.to_module());
        }
        unwinder
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_main_executable_is_found() {
        let objects = loaded_objects();
        let address = test_main_executable_is_found as usize as u64;
        let object = objects
            .iter()
            .find(|object| object.contains(address))
            .expect("the test binary should contain its own code");
        assert!(object.name.is_empty());
        assert_eq!(object.path(), Some(PathBuf::from("/proc/self/exe")));
        assert!(object.eh_frame_hdr.is_some());
    }

    #[test]
    fn test_process_unwinder_has_unwind_data() {
        let address = test_process_unwinder_has_unwind_data as usize as u64;
        let module = process_unwinder()
            .find_module_for_address(address)
            .expect("module for test code");
        assert!(module.has_unwind_data());
        assert!(module.address_range().contains(&address));
    }
}
