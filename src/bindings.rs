//! C Bindings for venom_shm
//!
//! The narrow byte-oriented surface a host-language binding layer calls.
//! Functions return `0` on success or one of the negative `VENOM_ERR_*`
//! codes.

use crate::channel::Channel;
use crate::error::{ErrorKind, VenomError};
use crate::semaphore::SemMode;
use std::ffi::CStr;
use std::os::raw::c_char;
use std::ptr;
use std::slice;
use tracing::debug;

pub const VENOM_OK: i32 = 0;
/// Invalid argument or configuration
pub const VENOM_ERR_CONFIG: i32 = -1;
/// Key, semaphore or shared memory could not be created or attached
pub const VENOM_ERR_RESOURCE: i32 = -2;
/// Offset/length outside the region or payload too large
pub const VENOM_ERR_RANGE: i32 = -3;
/// Lock or read retry budget exhausted
pub const VENOM_ERR_TRANSIENT: i32 = -4;
/// Channel already closed
pub const VENOM_ERR_CLOSED: i32 = -5;

// Opaque handle
pub struct VenomChannelHandle(Channel);

fn status(err: &VenomError) -> i32 {
    if matches!(err, VenomError::Closed(_)) {
        return VENOM_ERR_CLOSED;
    }
    match err.kind() {
        ErrorKind::Config => VENOM_ERR_CONFIG,
        ErrorKind::Resource => VENOM_ERR_RESOURCE,
        ErrorKind::Range => VENOM_ERR_RANGE,
        ErrorKind::TransientLock => VENOM_ERR_TRANSIENT,
    }
}

fn to_status(result: crate::Result<()>) -> i32 {
    match result {
        Ok(()) => VENOM_OK,
        Err(e) => {
            debug!(error = %e, "venom call failed");
            status(&e)
        }
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn bytes_arg<'a>(data: *const u8, len: usize) -> Option<&'a [u8]> {
    if len == 0 {
        Some(&[])
    } else if data.is_null() {
        None
    } else {
        Some(slice::from_raw_parts(data, len))
    }
}

/// Open a channel
///
/// `sem_mode`: 0 = attach existing, 1 = create new, 2 = invalid.
/// The key directory and retry cap come from `VENOM_KEY_DIR` and
/// `VENOM_MAX_RETRIES`. Returns null on failure.
///
/// # Safety
/// `name` and `sem_key_name` must be valid null-terminated strings
#[no_mangle]
pub unsafe extern "C" fn venom_channel_open(
    name: *const c_char,
    size: usize,
    double_buffer: bool,
    sem_key_name: *const c_char,
    sem_mode: i32,
) -> *mut VenomChannelHandle {
    let (name, sem_key_name) = match (str_arg(name), str_arg(sem_key_name)) {
        (Some(n), Some(k)) => (n, k),
        _ => return ptr::null_mut(),
    };
    let mode = match SemMode::from_code(sem_mode) {
        Some(mode) => mode,
        None => return ptr::null_mut(),
    };

    match Channel::open(name, size, double_buffer, sem_key_name, mode) {
        Ok(channel) => Box::into_raw(Box::new(VenomChannelHandle(channel))),
        Err(e) => {
            debug!(name, error = %e, "venom_channel_open failed");
            ptr::null_mut()
        }
    }
}

/// Write `length` bytes from `data` at `offset`
///
/// # Safety
/// `handle` must come from `venom_channel_open`; `data` must point to
/// `length` readable bytes
#[no_mangle]
pub unsafe extern "C" fn venom_channel_write_range(
    handle: *mut VenomChannelHandle,
    offset: usize,
    length: usize,
    data: *const u8,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return VENOM_ERR_CONFIG;
    };
    let Some(data) = bytes_arg(data, length) else {
        return VENOM_ERR_CONFIG;
    };
    to_status(h.0.write_range(offset, length, data))
}

/// Set or clear the bits of `mask` in the byte at `offset`
///
/// # Safety
/// `handle` must come from `venom_channel_open`
#[no_mangle]
pub unsafe extern "C" fn venom_channel_write_masked_byte(
    handle: *mut VenomChannelHandle,
    offset: usize,
    mask: u8,
    value: bool,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return VENOM_ERR_CONFIG;
    };
    to_status(h.0.write_masked_byte(offset, mask, value))
}

/// Copy the whole region into `buf`
///
/// Returns the number of bytes copied or a negative status. `buf_len` must
/// be at least the channel size.
///
/// # Safety
/// `handle` must come from `venom_channel_open`; `buf` must point to
/// `buf_len` writable bytes
#[no_mangle]
pub unsafe extern "C" fn venom_channel_read_all(
    handle: *mut VenomChannelHandle,
    buf: *mut u8,
    buf_len: usize,
) -> isize {
    let Some(h) = handle.as_ref() else {
        return VENOM_ERR_CONFIG as isize;
    };
    if buf.is_null() {
        return VENOM_ERR_CONFIG as isize;
    }
    if buf_len < h.0.size() {
        return VENOM_ERR_RANGE as isize;
    }
    match h.0.read_all() {
        Ok(data) => {
            let out = slice::from_raw_parts_mut(buf, buf_len);
            out[..data.len()].copy_from_slice(&data);
            data.len() as isize
        }
        Err(e) => status(&e) as isize,
    }
}

/// Unsynchronized overwrite of the start of the region
///
/// # Safety
/// `handle` must come from `venom_channel_open`; `data` must point to `len`
/// readable bytes
#[no_mangle]
pub unsafe extern "C" fn venom_channel_replace_all(
    handle: *mut VenomChannelHandle,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(h) = handle.as_ref() else {
        return VENOM_ERR_CONFIG;
    };
    let Some(data) = bytes_arg(data, len) else {
        return VENOM_ERR_CONFIG;
    };
    to_status(h.0.replace_all(data))
}

/// Payload size of the channel
///
/// # Safety
/// `handle` must come from `venom_channel_open`
#[no_mangle]
pub unsafe extern "C" fn venom_channel_size(handle: *mut VenomChannelHandle) -> usize {
    handle.as_ref().map(|h| h.0.size()).unwrap_or(0)
}

/// Close the channel; the handle stays allocated until destroyed
///
/// # Safety
/// `handle` must come from `venom_channel_open`
#[no_mangle]
pub unsafe extern "C" fn venom_channel_close(handle: *mut VenomChannelHandle) -> i32 {
    let Some(h) = handle.as_mut() else {
        return VENOM_ERR_CONFIG;
    };
    to_status(h.0.close())
}

/// Close (if needed) and free a channel handle
///
/// # Safety
/// `handle` must come from `venom_channel_open` and not be used afterwards
#[no_mangle]
pub unsafe extern "C" fn venom_channel_destroy(handle: *mut VenomChannelHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn test_c_api_roundtrip() {
        let tag = format!("venom_capi_{}", std::process::id());
        let name = CString::new(tag.clone()).unwrap();
        let key = CString::new(format!("{}_lock", tag)).unwrap();

        unsafe {
            let h = venom_channel_open(name.as_ptr(), 8, true, key.as_ptr(), 1);
            assert!(!h.is_null());
            assert_eq!(venom_channel_size(h), 8);

            let payload = [1u8, 2, 3];
            assert_eq!(venom_channel_write_range(h, 5, 3, payload.as_ptr()), VENOM_OK);
            assert_eq!(venom_channel_write_range(h, 7, 3, payload.as_ptr()), VENOM_ERR_RANGE);
            assert_eq!(venom_channel_write_masked_byte(h, 0, 0b0110, true), VENOM_OK);

            let mut out = [0u8; 8];
            assert_eq!(venom_channel_read_all(h, out.as_mut_ptr(), out.len()), 8);
            assert_eq!(out, [0b0110, 0, 0, 0, 0, 1, 2, 3]);

            let mut short = [0u8; 4];
            assert_eq!(
                venom_channel_read_all(h, short.as_mut_ptr(), short.len()),
                VENOM_ERR_RANGE as isize
            );

            assert_eq!(venom_channel_close(h), VENOM_OK);
            assert_eq!(venom_channel_close(h), VENOM_OK);
            assert_eq!(
                venom_channel_write_masked_byte(h, 0, 1, true),
                VENOM_ERR_CLOSED
            );
            venom_channel_destroy(h);
        }
    }

    #[test]
    fn test_c_api_rejects_bad_arguments() {
        let name = CString::new("venom_capi_bad").unwrap();
        unsafe {
            assert!(venom_channel_open(ptr::null(), 8, false, name.as_ptr(), 1).is_null());
            assert!(venom_channel_open(name.as_ptr(), 8, false, name.as_ptr(), 9).is_null());
            assert!(venom_channel_open(name.as_ptr(), 0, false, name.as_ptr(), 1).is_null());
            assert_eq!(
                venom_channel_write_range(ptr::null_mut(), 0, 0, ptr::null()),
                VENOM_ERR_CONFIG
            );
            assert_eq!(venom_channel_size(ptr::null_mut()), 0);
            venom_channel_destroy(ptr::null_mut());
        }
    }
}
