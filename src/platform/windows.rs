//! Named file mapping (the Windows equivalent of SysV shared memory) and
//! structured-exception classification.

use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingA, MapViewOfFile, OpenFileMappingA, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    PAGE_READWRITE,
};

use super::ShMem;
use crate::error::Result;

pub struct WindowsShMem {
    name: String,
    mapping: HANDLE,
    view: *mut core::ffi::c_void,
    size: usize,
}

unsafe impl Send for WindowsShMem {}

impl WindowsShMem {
    pub fn create(size: usize, worker_id: usize) -> Result<Self> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = format!("{now}_{worker_id}\0");

        let mapping = unsafe {
            CreateFileMappingA(
                INVALID_HANDLE_VALUE,
                std::ptr::null(),
                PAGE_READWRITE,
                0,
                size as u32,
                name.as_ptr(),
            )
        };
        if mapping == 0 {
            return Err(super::missing_shmem_error(format!(
                "CreateFileMappingA failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            unsafe { CloseHandle(mapping) };
            return Err(super::missing_shmem_error(format!(
                "MapViewOfFile failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            name: name.trim_end_matches('\0').to_string(),
            mapping,
            view: view.Value,
            size,
        })
    }
}

impl Drop for WindowsShMem {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(std::mem::transmute(self.view));
            CloseHandle(self.mapping);
        }
    }
}

impl ShMem for WindowsShMem {
    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.view.cast::<u8>(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.view.cast::<u8>(), self.size) }
    }

    fn export_to_env(&self, cmd: &mut Command, var: &str) {
        cmd.env(var, &self.name);
    }
}

/// The virgin/crash bitmaps shared across worker processes. Since
/// workers here are separate re-exec'd processes rather than forked
/// children, the mapping is addressed by name instead of inherited: the
/// supervisor creates it and passes `name` to each worker via an
/// environment variable, and every worker opens the same name.
pub struct SharedRegion {
    name: String,
    mapping: HANDLE,
    view: *mut core::ffi::c_void,
    size: usize,
    owns_cleanup: bool,
}

unsafe impl Send for SharedRegion {}

impl SharedRegion {
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let cname = format!("{name}\0");
        let mapping = unsafe {
            CreateFileMappingA(INVALID_HANDLE_VALUE, std::ptr::null(), PAGE_READWRITE, 0, size as u32, cname.as_ptr())
        };
        if mapping == 0 {
            return Err(super::missing_shmem_error(format!(
                "CreateFileMappingA failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            unsafe { CloseHandle(mapping) };
            return Err(super::missing_shmem_error("MapViewOfFile failed".to_string()));
        }
        Ok(Self { name: name.to_string(), mapping, view: view.Value, size, owns_cleanup: true })
    }

    pub fn open_existing(name: &str, size: usize) -> Result<Self> {
        let cname = format!("{name}\0");
        let mapping = unsafe { OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, cname.as_ptr()) };
        if mapping == 0 {
            return Err(super::missing_shmem_error(format!(
                "OpenFileMappingA failed for {name}: {}",
                std::io::Error::last_os_error()
            )));
        }
        let view = unsafe { MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size) };
        if view.Value.is_null() {
            unsafe { CloseHandle(mapping) };
            return Err(super::missing_shmem_error("MapViewOfFile failed".to_string()));
        }
        Ok(Self { name: name.to_string(), mapping, view: view.Value, size, owns_cleanup: false })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.view.cast::<u8>(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.view.cast::<u8>(), self.size) }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            UnmapViewOfFile(std::mem::transmute(self.view));
            CloseHandle(self.mapping);
        }
        let _ = self.owns_cleanup;
    }
}

// Standard NTSTATUS codes bracketing the "this is a memory-safety class
// crash" range, matching the set afl-fuzz-on-Windows ports use.
const EXCEPTION_FIRST_CRITICAL_CODE: u32 = 0xC000_0005; // STATUS_ACCESS_VIOLATION
const EXCEPTION_LAST_CRITICAL_CODE: u32 = 0xC000_00FE; // one past STATUS_STACK_OVERFLOW
const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

pub fn is_critical_windows(exception_code: u32) -> bool {
    if exception_code == STATUS_CONTROL_C_EXIT {
        return false;
    }
    (EXCEPTION_FIRST_CRITICAL_CODE..EXCEPTION_LAST_CRITICAL_CODE).contains(&exception_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_violation_is_critical() {
        assert!(is_critical_windows(0xC0000005));
    }

    #[test]
    fn ctrl_c_is_not_critical() {
        assert!(!is_critical_windows(STATUS_CONTROL_C_EXIT));
    }
}
