use std::{ffi::CStr, os::raw::c_char};

/// Copy a borrowed C string. Invalid UTF-8 is replaced.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL terminated string.
pub unsafe fn copy_cstr(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
}

/// Copy a C string allocated with `malloc` and free it.
///
/// # Safety
///
/// `ptr` must be null or a NUL terminated string owned by the caller and
/// releasable with `free`. It must not be used afterwards.
pub unsafe fn take_cstr(ptr: *mut c_char) -> Option<String> {
    let out = copy_cstr(ptr);
    if !ptr.is_null() {
        libc::free(ptr.cast());
    }
    out
}

/// Name stored in a fixed size, NUL padded field.
pub fn field_name(field: &[c_char]) -> String {
    let bytes: Vec<u8> = field.iter().take_while(|c| **c != 0).map(|c| *c as u8).collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
