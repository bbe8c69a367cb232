//! A fixed-size PIN buffer living inside a locked, guarded, core-dump-excluded
//! memory mapping (spec §4.2).
//!
//! The mapping is three pages: the first and third are `PROT_NONE` and
//! never touched again after `new()`; the middle page holds the actual
//! buffer and is `mlock`ed so it can never be swapped out. This mirrors the
//! raw `libc` FFI style the teacher workspace uses for its own
//! security-sensitive memory handling (`thrussh-libsodium`), just built on
//! `mmap`/`mprotect`/`mlock` instead of libsodium's `sodium_malloc`.

use std::ptr;

use crate::error::PinError;

/// Maximum PIN length the store will hold (spec §3).
pub const MAX: usize = 16;

fn page_size() -> usize {
    // SAFETY: sysconf with _SC_PAGESIZE never fails on a real system.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub struct PinStore {
    /// Base address of the 3-page mapping.
    base: *mut libc::c_void,
    /// Address of the usable (middle) page.
    buf: *mut u8,
    page_len: usize,
    len: usize,
}

// The mapping is only ever touched from the single event-loop thread, but
// `AgentState` is moved into the tokio task at startup.
unsafe impl Send for PinStore {}

impl PinStore {
    pub fn new() -> Self {
        let page_len = page_size();
        let total = page_len * 3;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            panic!("failed to map PIN store guard region");
        }
        let buf = unsafe { (base as *mut u8).add(page_len) };
        unsafe {
            if libc::mprotect(buf as *mut libc::c_void, page_len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
                panic!("failed to unprotect PIN store page");
            }
            libc::mlock(buf as *const libc::c_void, page_len);
            exclude_from_core_dump(buf, page_len);
        }
        PinStore {
            base,
            buf,
            page_len,
            len: 0,
        }
    }

    /// Validate and store a new PIN; on any validation failure the store is
    /// left cleared rather than holding a partial/invalid value.
    pub fn set(&mut self, pin: &[u8]) -> Result<(), PinError> {
        if pin.len() < 6 || pin.len() > 8 || !pin.iter().all(|b| b.is_ascii_alphanumeric()) {
            self.clear();
            return Err(PinError::InvalidPin(0));
        }
        let slice = unsafe { std::slice::from_raw_parts_mut(self.buf, self.page_len) };
        slice[..pin.len()].copy_from_slice(pin);
        self.len = pin.len();
        Ok(())
    }

    /// Zero the buffer and drop the cached length to zero. The only way to
    /// transition out of "PIN cached" (spec §4.2).
    pub fn clear(&mut self) {
        let slice = unsafe { std::slice::from_raw_parts_mut(self.buf, self.page_len) };
        slice.iter_mut().for_each(|b| *b = 0);
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf, self.len) }
    }
}

impl Drop for PinStore {
    fn drop(&mut self) {
        self.clear();
        unsafe {
            libc::munlock(self.buf as *const libc::c_void, self.page_len);
            libc::munmap(self.base, self.page_len * 3);
        }
    }
}

#[cfg(target_os = "linux")]
unsafe fn exclude_from_core_dump(buf: *mut u8, len: usize) {
    libc::madvise(buf as *mut libc::c_void, len, libc::MADV_DONTDUMP);
}

#[cfg(not(target_os = "linux"))]
unsafe fn exclude_from_core_dump(_buf: *mut u8, _len: usize) {
    // No portable equivalent; the locked mapping still keeps the PIN out of
    // swap, which is the property the rest of the codebase depends on.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_and_long_pins() {
        let mut store = PinStore::new();
        assert!(store.set(b"1234").is_err());
        assert_eq!(store.len(), 0);
        assert!(store.set(b"123456789").is_err());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn accepts_boundary_lengths() {
        let mut store = PinStore::new();
        assert!(store.set(b"123456").is_ok());
        assert_eq!(store.len(), 6);
        assert!(store.set(b"12345678").is_ok());
        assert_eq!(store.len(), 8);
    }

    #[test]
    fn rejects_non_alphanumeric() {
        let mut store = PinStore::new();
        assert!(store.set(b"12345!@").is_err());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn clear_zeroes_and_resets_length() {
        let mut store = PinStore::new();
        store.set(b"123456").unwrap();
        store.clear();
        assert_eq!(store.len(), 0);
        assert!(store.as_bytes().is_empty());
    }
}
