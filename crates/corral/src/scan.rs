//! Enumeration of native modules mapped into the current process.
//!
//! Idempotent and side-effect free; the only work besides OS introspection
//! calls is accumulation on the Rust side. Output order is the OS iteration
//! order, which downstream components treat as discovery order.

use std::path::PathBuf;

use crate::error::ScanError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub base_addr: usize,
}

#[cfg(target_os = "linux")]
pub fn scan() -> Result<Vec<LoadedModule>, ScanError> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let out = &mut *(data as *mut Vec<LoadedModule>);
        let info = &*info;
        if info.dlpi_name.is_null() {
            return 0;
        }
        let name = CStr::from_ptr(info.dlpi_name).to_bytes();
        // The main executable reports an empty name; the vDSO has no
        // filesystem path. Neither is a loadable backend.
        if name.is_empty() || !name.starts_with(b"/") {
            return 0;
        }
        out.push(LoadedModule {
            path: PathBuf::from(OsStr::from_bytes(name)),
            base_addr: info.dlpi_addr as usize,
        });
        0
    }

    let mut out: Vec<LoadedModule> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut out as *mut _ as *mut libc::c_void);
    }
    Ok(out)
}

#[cfg(target_os = "macos")]
pub fn scan() -> Result<Vec<LoadedModule>, ScanError> {
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;

    extern "C" {
        fn _dyld_image_count() -> u32;
        fn _dyld_get_image_name(idx: u32) -> *const libc::c_char;
        fn _dyld_get_image_header(idx: u32) -> *const libc::c_void;
    }

    let mut out: Vec<LoadedModule> = Vec::new();
    // The image list can shrink between count and lookup if another thread
    // unloads a bundle; null returns are skipped rather than treated as errors.
    let count = unsafe { _dyld_image_count() };
    for idx in 0..count {
        let name = unsafe { _dyld_get_image_name(idx) };
        if name.is_null() {
            continue;
        }
        let name = unsafe { CStr::from_ptr(name) }.to_bytes();
        if name.is_empty() {
            continue;
        }
        let header = unsafe { _dyld_get_image_header(idx) };
        out.push(LoadedModule {
            path: PathBuf::from(OsStr::from_bytes(name)),
            base_addr: header as usize,
        });
    }
    Ok(out)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn scan() -> Result<Vec<LoadedModule>, ScanError> {
    Err(ScanError::Unsupported)
}

#[cfg(all(test, any(target_os = "linux", target_os = "macos")))]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_libc() {
        let modules = scan().expect("scan supported on this target");
        assert!(!modules.is_empty());
        assert!(modules.iter().any(|m| {
            let name = m.path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            name.starts_with("libc") || name.starts_with("libSystem")
        }));
    }

    #[test]
    fn scan_is_idempotent() {
        let a = scan().unwrap();
        let b = scan().unwrap();
        assert_eq!(a, b);
    }
}
