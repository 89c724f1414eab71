//! Linux implementation of the process-reader capability.
//!
//! Attachment uses `ptrace(PTRACE_ATTACH)`, bulk reads go through
//! `process_vm_readv` (no per-word peeking), and the region map comes from
//! `/proc/<pid>/maps`. Reading another user's process requires the usual
//! ptrace privileges (`CAP_SYS_PTRACE` or a permissive
//! `kernel.yama.ptrace_scope`).
//!
//! Builds both as an rlib for static linking and as a `cdylib` exposing the
//! `create_reader` entry point for the plugin loader.

use std::fs;
use std::ptr;

use log::debug;

use heapscope_core::reader::{MemRegion, ProcessReader};

#[derive(Default)]
pub struct LinuxReader {
    pid: Option<libc::pid_t>,
}

impl LinuxReader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessReader for LinuxReader {
    fn attach(&mut self, pid: u32) -> bool {
        self.detach();

        let pid = pid as libc::pid_t;
        let rc = unsafe {
            libc::ptrace(
                libc::PTRACE_ATTACH,
                pid,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            )
        };
        if rc == -1 {
            debug!(
                "ptrace attach to {} failed: {}",
                pid,
                std::io::Error::last_os_error()
            );
            return false;
        }

        // The target counts as attached once it has stopped.
        unsafe { libc::waitpid(pid, ptr::null_mut(), 0) };
        self.pid = Some(pid);
        true
    }

    fn detach(&mut self) {
        if let Some(pid) = self.pid.take() {
            unsafe {
                libc::ptrace(
                    libc::PTRACE_DETACH,
                    pid,
                    ptr::null_mut::<libc::c_void>(),
                    ptr::null_mut::<libc::c_void>(),
                );
            }
        }
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        if buf.is_empty() {
            return true;
        }

        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let n = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
        n == buf.len() as isize
    }

    fn regions(&self) -> Vec<MemRegion> {
        let Some(pid) = self.pid else {
            return Vec::new();
        };
        match fs::read_to_string(format!("/proc/{}/maps", pid)) {
            Ok(maps) => parse_maps(&maps),
            Err(err) => {
                debug!("reading /proc/{}/maps failed: {}", pid, err);
                Vec::new()
            }
        }
    }
}

impl Drop for LinuxReader {
    fn drop(&mut self) {
        self.detach();
    }
}

fn parse_maps(maps: &str) -> Vec<MemRegion> {
    maps.lines().filter_map(parse_maps_line).collect()
}

/// One `/proc/<pid>/maps` line:
/// `55d9a3e000-55d9a3f000 r-xp 00000000 08:01 123456  /usr/bin/python3.10`
fn parse_maps_line(line: &str) -> Option<MemRegion> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }

    let (start, end) = tokens[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let perms = tokens[1].as_bytes();
    let mut permissions = 0;
    if perms.first() == Some(&b'r') {
        permissions |= MemRegion::READ;
    }
    if perms.get(1) == Some(&b'w') {
        permissions |= MemRegion::WRITE;
    }
    if perms.get(2) == Some(&b'x') {
        permissions |= MemRegion::EXEC;
    }

    // tokens 2..5 are offset, device and inode; the pathname may contain
    // spaces (" (deleted)" suffixes).
    let name = if tokens.len() > 5 {
        Some(tokens[5..].join(" "))
    } else {
        None
    };

    Some(MemRegion::new(start, end, permissions, name))
}

/// Plugin entry point; the caller takes ownership.
#[no_mangle]
pub extern "C" fn create_reader() -> *mut dyn ProcessReader {
    Box::into_raw(Box::new(LinuxReader::new()))
}
